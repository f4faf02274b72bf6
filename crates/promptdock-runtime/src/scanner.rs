//! Log scanning: port-beacon discovery and operator log forwarding.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::RuntimeState;
use crate::supervisor::Supervisor;

/// Find the advertised listening port in buffered program output.
///
/// Accepts `PORT=<n>` and `PORT=:<n>`; as a fallback, a line whose last
/// `:`-separated token is an integer (servers often log `listening on
/// host:port`). Non-numeric values never parse.
pub fn extract_port(logs: &str) -> Option<u16> {
    for line in logs.lines() {
        if line.contains("PORT=") {
            // Take the text between the first '=' and the next one, if any.
            let after = line.splitn(2, '=').nth(1).unwrap_or("");
            let value = after.split('=').next().unwrap_or(after);
            let value = value.strip_prefix(':').unwrap_or(value);
            if let Ok(port) = value.parse::<u16>() {
                if port > 0 {
                    return Some(port);
                }
            }
        } else if line.contains(':') {
            let tail = line.rsplit(':').next().unwrap_or("");
            if let Ok(port) = tail.trim().parse::<u16>() {
                if port > 0 {
                    return Some(port);
                }
            }
        }
    }
    None
}

/// Per-runtime scanner task.
///
/// Polls the runtime's log buffer: before a port is known it looks for the
/// beacon; once found it records the port, registers the proxy route, settles,
/// and runs the health check. Afterwards it keeps draining program output into
/// the operator log, tagged with the runtime id, until the attempt token
/// cancels.
pub(crate) async fn run_scanner(
    supervisor: Arc<Supervisor>,
    id: String,
    attempt: CancellationToken,
    parent: CancellationToken,
) {
    let Some(buffer) = supervisor.registry.load(&id).and_then(|r| r.logs.clone()) else {
        warn!(runtime = %id, "scanner started without a log buffer");
        return;
    };

    let mut registered = false;
    loop {
        if attempt.is_cancelled() {
            return;
        }

        if !registered {
            if let Some(port) = extract_port(&buffer.snapshot()) {
                buffer.drain();
                registered = true;
                info!(runtime = %id, port, "runtime advertised its port");
                supervisor.registry.update(&id, |r| {
                    r.port = port;
                    r.state = RuntimeState::Running;
                });
                supervisor.persist(&id).await;
                supervisor.routes.register(&id, port).await;

                // Settle before probing through the public router.
                tokio::select! {
                    _ = tokio::time::sleep(supervisor.timings.settle) => {}
                    _ = attempt.cancelled() => return,
                }
                supervisor.run_health_check(&id, &attempt, &parent).await;
                continue;
            }
        } else {
            forward_lines(&id, &buffer);
        }

        tokio::select! {
            _ = tokio::time::sleep(supervisor.timings.log_poll) => {}
            _ = attempt.cancelled() => return,
        }
    }
}

fn forward_lines(id: &str, buffer: &promptdock_sandbox::LogBuffer) {
    if buffer.is_empty() {
        return;
    }
    for line in buffer.drain().lines() {
        if line.is_empty() {
            continue;
        }
        info!(runtime = %id, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_beacon() {
        assert_eq!(extract_port("PORT=8080"), Some(8080));
    }

    #[test]
    fn parses_colon_prefixed_beacon() {
        assert_eq!(extract_port("PORT=:8080"), Some(8080));
    }

    #[test]
    fn parses_host_port_tail_fallback() {
        assert_eq!(extract_port("listening on 127.0.0.1:40000"), Some(40000));
    }

    #[test]
    fn rejects_non_numeric_beacon() {
        assert_eq!(extract_port("PORT=abc"), None);
    }

    #[test]
    fn skips_noise_until_beacon_line() {
        let logs = "starting up\nconfig loaded\nPORT=12345\nserving\n";
        assert_eq!(extract_port(logs), Some(12345));
    }

    #[test]
    fn empty_input_has_no_port() {
        assert_eq!(extract_port(""), None);
        assert_eq!(extract_port("no ports here\n"), None);
    }
}
