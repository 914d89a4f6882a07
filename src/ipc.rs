use crate::state::StatusChange;

/// Messages on the alert bus, manager → dispatcher.
#[derive(Debug, Clone)]
pub enum Evt {
    Change(StatusChange),
    /// End of a poll cycle: whatever was collected goes out as one alert.
    TickComplete,
    Shutdown,
}
