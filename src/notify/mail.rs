//! Alert mail: a `multipart/alternative` message handed to the local relay.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::GlobalSettings;
use crate::error::NotifyError;
use crate::notify::AlertNotifier;
use crate::state::StatusChange;

/// How long the relay gets to accept one message before it is killed.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(30);

const WAIT_STEP: Duration = Duration::from_millis(20);

pub struct MailNotifier {
    recipients: Vec<String>,
    from: String,
    hostname: String,
    sendmail: PathBuf,
    timeout: Duration,
}

impl MailNotifier {
    pub fn new(
        recipients: Vec<String>,
        from: Option<String>,
        sendmail: PathBuf,
    ) -> Self {
        let hostname = hostname();
        let from = from.unwrap_or_else(|| format!("procwatch@{hostname}"));
        Self {
            recipients,
            from,
            hostname,
            sendmail,
            timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_settings(settings: &GlobalSettings) -> Self {
        Self::new(
            settings.alert_recipients.clone(),
            settings.mail_from.clone(),
            settings.sendmail.clone(),
        )
    }

    /// Full RFC 5322 message, headers included.
    pub fn compose(&self, events: &[StatusChange], now: DateTime<Utc>) -> String {
        let boundary = format!("procwatch-{}", now.timestamp_nanos_opt().unwrap_or_default());
        let subject = match events {
            [one] => format!("[procwatch] {} is {} on {}", one.app, one.new, self.hostname),
            _ => format!(
                "[procwatch] {} status changes on {}",
                events.len(),
                self.hostname
            ),
        };

        let mut msg = String::new();
        let _ = writeln!(msg, "From: {}", self.from);
        let _ = writeln!(msg, "To: {}", self.recipients.join(", "));
        let _ = writeln!(msg, "Subject: {subject}");
        let _ = writeln!(msg, "Date: {}", now.to_rfc2822());
        let _ = writeln!(msg, "MIME-Version: 1.0");
        let _ = writeln!(
            msg,
            "Content-Type: multipart/alternative; boundary=\"{boundary}\""
        );
        let _ = writeln!(msg);
        let _ = writeln!(msg, "--{boundary}");
        let _ = writeln!(msg, "Content-Type: text/plain; charset=utf-8");
        let _ = writeln!(msg);
        msg.push_str(&self.plain_body(events));
        let _ = writeln!(msg);
        let _ = writeln!(msg, "--{boundary}");
        let _ = writeln!(msg, "Content-Type: text/html; charset=utf-8");
        let _ = writeln!(msg);
        msg.push_str(&self.html_body(events));
        let _ = writeln!(msg);
        let _ = writeln!(msg, "--{boundary}--");
        msg
    }

    fn plain_body(&self, events: &[StatusChange]) -> String {
        let mut body = format!(
            "Process status changes on server {}\n\nApplication\tFrom\tTo\tTime (UTC)\n\n",
            self.hostname
        );
        for e in events {
            let _ = writeln!(
                body,
                "{}\t{}\t{}\t{}",
                e.app,
                e.old,
                e.new,
                e.at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        body
    }

    fn html_body(&self, events: &[StatusChange]) -> String {
        let mut body = format!(
            "<html><head><title>procwatch alert</title></head><body>\
             <br /><br />Process status changes on server <b>{}</b><br /><br />\
             <table border=\"0\" cellpadding=\"5\" cellspacing=\"5\">\
             <tr><td align=\"center\"><b>Application</b></td>\
             <td align=\"center\"><b>From</b></td>\
             <td align=\"center\"><b>To</b></td>\
             <td align=\"center\"><b>Time (UTC)</b></td></tr>",
            escape_html(&self.hostname)
        );
        for e in events {
            let _ = write!(
                body,
                "<tr><td align=\"center\">{}</td><td align=\"center\">{}</td>\
                 <td align=\"center\">{}</td><td align=\"center\">{}</td></tr>",
                escape_html(&e.app),
                e.old,
                e.new,
                e.at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        body.push_str("</table></body></html>\n");
        body
    }

    fn deliver(&self, message: &str) -> Result<(), NotifyError> {
        let mut child = Command::new(&self.sendmail)
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| NotifyError::Spawn {
                path: self.sendmail.clone(),
                source,
            })?;

        // Dropping stdin is the relay's end of message.
        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(message.as_bytes())
        {
            kill_and_reap(&mut child);
            return Err(NotifyError::Io(e));
        }

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    kill_and_reap(&mut child);
                    return Err(NotifyError::Timeout(self.timeout));
                }
                Ok(None) => thread::sleep(WAIT_STEP),
                Err(e) => {
                    kill_and_reap(&mut child);
                    return Err(NotifyError::Io(e));
                }
            }
        };
        if !status.success() {
            return Err(NotifyError::Relay(status));
        }
        Ok(())
    }
}

fn kill_and_reap(child: &mut Child) {
    child.kill().ok();
    child.wait().ok();
}

impl AlertNotifier for MailNotifier {
    fn notify(&self, event: &StatusChange) -> Result<(), NotifyError> {
        self.notify_batch(std::slice::from_ref(event))
    }

    fn notify_batch(&self, events: &[StatusChange]) -> Result<(), NotifyError> {
        if events.is_empty() || self.recipients.is_empty() {
            return Ok(());
        }
        self.deliver(&self.compose(events, Utc::now()))
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
