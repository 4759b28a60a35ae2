//! Per-step log writer.

use std::sync::Arc;

use tracing::debug;

use crate::context::events::{LogEvent, streams};
use crate::context::step_context::StepContext;

/// Writes log events for a step.
///
/// Once the step has finished its log is closed and writes go to the nearest
/// ancestor whose log is still open.
pub struct LogWriter<'a> {
    context: &'a Arc<StepContext>,
}

impl<'a> LogWriter<'a> {
    pub(crate) fn new(context: &'a Arc<StepContext>) -> Self {
        Self { context }
    }

    pub fn write(&self, stream: &str, text: impl Into<String>) {
        self.publish(LogEvent::Write {
            stream: stream.to_string(),
            text: text.into(),
        });
    }

    pub fn write_line(&self, stream: &str, text: impl AsRef<str>) {
        self.write(stream, format!("{}\n", text.as_ref()));
    }

    pub fn failure(&self, text: impl Into<String>) {
        self.write(streams::FAILURES, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.write(streams::WARNINGS, text);
    }

    pub fn begin_section(&self, stream: &str, name: impl Into<String>) {
        self.publish(LogEvent::BeginSection {
            stream: stream.to_string(),
            name: name.into(),
        });
    }

    pub fn end_section(&self, stream: &str) {
        self.publish(LogEvent::EndSection {
            stream: stream.to_string(),
        });
    }

    pub fn attach(&self, name: impl Into<String>, content_type: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.publish(LogEvent::Attach {
            name: name.into(),
            content_type: content_type.into(),
            content: content.into(),
        });
    }

    pub fn embed(&self, stream: &str, attachment: impl Into<String>) {
        self.publish(LogEvent::Embed {
            stream: stream.to_string(),
            attachment: attachment.into(),
        });
    }

    fn publish(&self, log: LogEvent) {
        let mut log = log;
        let mut target = Some(Arc::clone(self.context));
        while let Some(context) = target {
            match context.publish_log(log) {
                Ok(()) => return,
                Err(rejected) => {
                    log = rejected;
                    target = context.parent();
                }
            }
        }
        debug!(step = %self.context.step().id, log = ?log, "log event dropped: no open log");
    }
}
