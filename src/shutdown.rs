// src/shutdown.rs
//
// Shutdown observer attached to every connection the registry creates.
// A clean close (reply code 200) is expected and stays quiet; anything
// else is reported once to the log sink, tagged so the downstream
// collector can route it. The observer never replaces the connection;
// the registry does that lazily on the next acquisition.

use lapin::{Connection, Error as LapinError};
use tracing::error;

/// Category tag on connection-lifecycle error records.
pub(crate) const CONNECTION_CATEGORY: &str = "rabbitmq/connection";
pub(crate) const SHUTDOWN_CATEGORY: &str = "rabbitmq/connection-shutdown";

/// Index identifier the external sink routes these records to.
pub(crate) const LOG_INDEX: &str = "rabbitmq-client";

/// AMQP reply code for a clean connection close.
const REPLY_SUCCESS: u16 = 200;

/// Registers the observer on a freshly opened connection, bound to the
/// scope label ("default" or the connection-type tag) for attribution.
pub(crate) fn register(connection: &Connection, scope: &str) {
    let scope = scope.to_string();
    connection.on_error(move |err| {
        let code = reply_code(&err);
        if should_log(code) {
            error!(
                category = SHUTDOWN_CATEGORY,
                index = LOG_INDEX,
                scope = %scope,
                reply_code = code,
                error = %err,
                "connection shut down uncleanly"
            );
        }
    });
}

/// Broker-reported reply code, when the teardown carried one. Transport
/// failures (I/O errors, protocol violations) carry none.
fn reply_code(err: &LapinError) -> Option<u16> {
    match err {
        LapinError::ProtocolError(amqp_err) => Some(amqp_err.get_id()),
        _ => None,
    }
}

/// Everything except an explicit clean close gets logged, including
/// teardowns with no reply code at all.
fn should_log(reply_code: Option<u16>) -> bool {
    reply_code != Some(REPLY_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::AMQPError;

    #[test]
    fn test_clean_close_is_not_logged() {
        assert!(!should_log(Some(REPLY_SUCCESS)));
    }

    #[test]
    fn test_unclean_close_is_logged() {
        // CONNECTION_FORCED and NOT_FOUND, the common unclean cases.
        assert!(should_log(Some(320)));
        assert!(should_log(Some(404)));
    }

    #[test]
    fn test_transport_failure_without_reply_code_is_logged() {
        assert!(should_log(None));
    }

    #[test]
    fn test_reply_code_extraction() {
        let amqp_err =
            AMQPError::from_id(320, "CONNECTION_FORCED - broker restarted".into()).unwrap();
        let err = LapinError::ProtocolError(amqp_err);
        assert_eq!(reply_code(&err), Some(320));

        let no_code = LapinError::InvalidConnectionState(lapin::ConnectionState::Closed);
        assert_eq!(reply_code(&no_code), None);
    }
}
