use std::io;
use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

use crate::cli::Args;

/// Where the proxy writes its logs. Stdout belongs to the MCP transport, so
/// events go to a daily-rolled JSON file and, optionally, stderr.
#[derive(Debug, Clone)]
pub(crate) struct LogOptions {
    pub(crate) dir: PathBuf,
    pub(crate) file_prefix: String,
    pub(crate) to_stderr: bool,
}

impl LogOptions {
    pub(crate) fn from_args(args: &Args) -> Self {
        Self {
            dir: args.log_dir.clone(),
            file_prefix: args.log_file.clone(),
            to_stderr: args.log_to_stderr,
        }
    }
}

pub(crate) fn init_tracing(
    options: &LogOptions,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&options.dir)
        .with_context(|| format!("failed to create log dir {}", options.dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&options.dir, &options.file_prefix);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer(file_writer));

    if options.to_stderr {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false);
        registry.with(stderr_layer).init();
    } else {
        registry.init();
    }

    Ok(file_guard)
}

/// One JSON object per event. The enclosing `task` span is flattened into a
/// `span` field so every line of a request carries its `request_id`.
fn json_layer<S, W>(writer: W) -> impl Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(false)
        .with_writer(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn lines(&self) -> Vec<serde_json::Value> {
            let raw = String::from_utf8(self.0.lock().expect("lock").clone()).expect("utf8");
            raw.lines()
                .map(|line| serde_json::from_str(line).expect("json line"))
                .collect()
        }
    }

    #[test]
    fn events_carry_the_task_span() {
        let captured = Captured::default();
        let writer = {
            let captured = captured.clone();
            move || captured.clone()
        };
        let subscriber = tracing_subscriber::registry().with(json_layer(writer));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("outside any task");
            let span = tracing::info_span!("task", request_id = "R3");
            let _entered = span.enter();
            tracing::info!(step_no = 2, "step observed");
        });

        let lines = captured.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].get("span").is_none());
        assert_eq!(lines[1]["span"]["name"], "task");
        assert_eq!(lines[1]["span"]["request_id"], "R3");
        assert_eq!(lines[1]["fields"]["step_no"], 2);
        assert_eq!(lines[1]["fields"]["message"], "step observed");
    }

    #[test]
    fn options_follow_cli_flags() {
        let args = Args::try_parse_from([
            "browser-task-proxy",
            "--log-dir",
            "/var/log/browser-task",
            "--log-file",
            "proxy-a.log",
            "--log-to-stderr",
        ])
        .expect("parse");
        let options = LogOptions::from_args(&args);
        assert_eq!(options.dir, PathBuf::from("/var/log/browser-task"));
        assert_eq!(options.file_prefix, "proxy-a.log");
        assert!(options.to_stderr);
    }
}
