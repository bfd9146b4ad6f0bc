//! Mail notifications about delivered files and served requests.
//!
//! When our own neighbour entry has an `exec.sendmail` command and a
//! `[notify.file]` or `[notify.freq]` target is configured, a short header
//! block is piped into that command with the target address appended as an
//! argument. Failures are logged and otherwise ignored.

use std::io::{self, Write};
use std::process::{Child, Command, ExitStatus, Stdio};

use data_encoding::BASE64;
use nncp_core::config::{NotifyConfig, NotifyTarget};
use nncp_core::{Neighbours, NodeId};

#[derive(Debug, Clone, Default)]
pub struct Notifier {
    sendmail: Vec<String>,
    file: Option<NotifyTarget>,
    freq: Option<NotifyTarget>,
}

impl Notifier {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(sendmail: Vec<String>, notify: &NotifyConfig) -> Self {
        Self {
            sendmail,
            file: notify.file.clone(),
            freq: notify.freq.clone(),
        }
    }

    /// Take the sendmail command from our own neighbour entry.
    pub fn from_config(neighbours: &Neighbours, self_id: &NodeId, notify: &NotifyConfig) -> Self {
        let sendmail = neighbours
            .get(self_id)
            .and_then(|me| me.exec.get("sendmail").cloned())
            .unwrap_or_default();
        Self::new(sendmail, notify)
    }

    pub fn file_received(&self, sender: &str, dst: &str, size: u64) {
        if let Some(target) = &self.file {
            let subject = format!(
                "File from {sender}: {dst} ({})",
                human_bytes::human_bytes(size as f64)
            );
            self.send(target, &subject);
        }
    }

    pub fn freq_served(&self, sender: &str, src: &str) {
        if let Some(target) = &self.freq {
            self.send(target, &format!("Freq from {sender}: {src}"));
        }
    }

    fn send(&self, target: &NotifyTarget, subject: &str) {
        let Some((program, args)) = self.sendmail.split_first() else {
            return;
        };
        let message = message(target, subject);
        let result = Command::new(program)
            .args(args)
            .arg(&target.to)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .and_then(|mut child| feed_and_wait(&mut child, message.as_bytes()));
        match result {
            Ok(status) if status.success() => {
                tracing::debug!(to = %target.to, subject, "notification sent");
            }
            Ok(status) => tracing::warn!(to = %target.to, %status, "sendmail failed"),
            Err(e) => tracing::warn!(to = %target.to, err = %e, "sendmail failed"),
        }
    }
}

/// Write `input` to the child's stdin, close it and reap the child, even
/// when the write fails.
fn feed_and_wait(child: &mut Child, input: &[u8]) -> io::Result<ExitStatus> {
    let fed = match child.stdin.take() {
        Some(mut stdin) => stdin.write_all(input),
        None => Ok(()),
    };
    let status = child.wait();
    fed.and(status)
}

/// RFC 822 header block for a notification.
pub fn message(target: &NotifyTarget, subject: &str) -> String {
    format!(
        "From: {}\nTo: {}\nSubject: {}\n",
        target.from,
        target.to,
        encode_word(subject)
    )
}

/// RFC 2047 B-encoding, applied only when the text is not plain printable
/// ASCII.
pub fn encode_word(text: &str) -> String {
    if text.bytes().all(|b| b == b'\t' || (b' '..=b'~').contains(&b)) {
        return text.to_string();
    }
    format!("=?UTF-8?b?{}?=", BASE64.encode(text.as_bytes()))
}
