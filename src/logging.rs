use tracing_subscriber::fmt::MakeWriter;

/// Install the global tracing subscriber. Every formatted line is also
/// mirrored into `log_tx` so the admin SSE stream can tail the process log.
pub fn init(log_tx: tokio::sync::broadcast::Sender<String>) {
    let writer = BroadcastMakeWriter { sender: log_tx };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .init();
}

#[derive(Clone)]
pub(crate) struct BroadcastMakeWriter {
    pub sender: tokio::sync::broadcast::Sender<String>,
}

impl<'a> MakeWriter<'a> for BroadcastMakeWriter {
    type Writer = BroadcastWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BroadcastWriter {
            sender: self.sender.clone(),
        }
    }
}

pub(crate) struct BroadcastWriter {
    sender: tokio::sync::broadcast::Sender<String>,
}

impl std::io::Write for BroadcastWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf).to_string();
        let _ = self.sender.send(msg); // Ignored if no receivers
        std::io::stdout().write(buf)?;
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}
