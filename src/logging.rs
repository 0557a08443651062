use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Lines retained for slow `/api/logs` subscribers before they lag.
pub(crate) const LOG_CHANNEL_CAPACITY: usize = 500;

/// Writer that fans each formatted line out to SSE subscribers and mirrors
/// it to stdout (which the gateway redirects into its log file).
#[derive(Clone)]
pub(crate) struct SseMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for SseMakeWriter {
    type Writer = SseWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SseWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct SseWriter {
    sender: broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl std::io::Write for SseWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf).trim_end().to_string();
        if !line.is_empty() {
            let _ = self.sender.send(line);
        }
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber. Returns the sender the API streams from.
pub(crate) fn init(level: Level) -> broadcast::Sender<String> {
    let (log_tx, _) = broadcast::channel::<String>(LOG_CHANNEL_CAPACITY);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(SseMakeWriter {
            sender: log_tx.clone(),
            suppress_stdout: false,
        })
        .finish();
    // Already set when embedded in tests.
    tracing::subscriber::set_global_default(subscriber).ok();
    log_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn lines_reach_subscribers_without_trailing_newline() {
        let (tx, mut rx) = broadcast::channel(8);
        let make = SseMakeWriter {
            sender: tx,
            suppress_stdout: true,
        };
        let mut writer = make.make_writer();
        writer.write_all(b"INFO job completed\n").unwrap();
        writer.write_all(b"\n").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "INFO job completed");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn writing_without_subscribers_succeeds() {
        let (tx, rx) = broadcast::channel::<String>(8);
        drop(rx);
        let mut writer = SseMakeWriter {
            sender: tx,
            suppress_stdout: true,
        }
        .make_writer();
        assert_eq!(writer.write(b"hello").unwrap(), 5);
    }
}
