//! Classification of server error replies.
//!
//! A cluster signals routing conditions through the leading token of an
//! error reply:
//! - `MOVED <slot> <host>:<port>` for a permanent slot move
//! - `ASK <slot> <host>:<port>` for a temporary redirect during migration
//! - `TRYAGAIN ...` for transient per-key unavailability
//! - `CLUSTERDOWN ...` when the cluster cannot serve requests

use crate::proto::error::Error;

/// Classifies an error reply payload into the routing taxonomy.
///
/// Anything without a recognized leading token becomes [`Error::Server`].
pub(crate) fn classify_server_error(payload: &[u8]) -> Error {
    let message = String::from_utf8_lossy(payload);
    let message = message.trim();

    let mut tokens = message.splitn(2, ' ');
    let head = tokens.next().unwrap_or_default();
    let rest = tokens.next().unwrap_or_default();

    match head {
        "MOVED" => match parse_redirect(rest) {
            Some((slot, address)) => Error::Moved { slot, address },
            None => Error::Server {
                message: message.to_string(),
            },
        },
        "ASK" => match parse_redirect(rest) {
            Some((slot, address)) => Error::Ask { slot, address },
            None => Error::Server {
                message: message.to_string(),
            },
        },
        "TRYAGAIN" => Error::TryAgain {
            message: rest.to_string(),
        },
        "CLUSTERDOWN" => Error::ClusterDown {
            message: rest.to_string(),
        },
        _ => Error::Server {
            message: message.to_string(),
        },
    }
}

/// Parses `<slot> <host>:<port>` redirect arguments.
fn parse_redirect(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let address = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }
    split_address(&address)?;
    Some((slot, address))
}

/// Splits a `host:port` endpoint into its parts.
///
/// The port is everything after the last colon, so bracketed IPv6 hosts
/// come through unchanged. Joining the parts back with a colon always
/// reproduces the input, which keeps pool keys canonical.
pub(crate) fn split_address(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_moved() {
        let error = classify_server_error(b"MOVED 3999 127.0.0.1:7000");
        match error {
            Error::Moved { slot, address } => {
                assert_eq!(slot, 3999);
                assert_eq!(address, "127.0.0.1:7000");
            }
            other => panic!("expected Moved, got {:?}", other),
        }
    }

    #[test]
    fn classify_ask() {
        let error = classify_server_error(b"ASK 12182 192.168.1.100:6379");
        match error {
            Error::Ask { slot, address } => {
                assert_eq!(slot, 12182);
                assert_eq!(address, "192.168.1.100:6379");
            }
            other => panic!("expected Ask, got {:?}", other),
        }
    }

    #[test]
    fn classify_tryagain() {
        let error = classify_server_error(b"TRYAGAIN Multiple keys request during rehashing");
        assert!(matches!(error, Error::TryAgain { .. }));
    }

    #[test]
    fn classify_clusterdown() {
        let error = classify_server_error(b"CLUSTERDOWN Hash slot not served");
        assert!(matches!(error, Error::ClusterDown { .. }));
        assert!(matches!(
            classify_server_error(b"CLUSTERDOWN"),
            Error::ClusterDown { .. }
        ));
    }

    #[test]
    fn classify_generic() {
        let error = classify_server_error(b"ERR unknown command");
        match error {
            Error::Server { message } => assert_eq!(message, "ERR unknown command"),
            other => panic!("expected Server, got {:?}", other),
        }
    }

    #[test]
    fn malformed_redirect_falls_back_to_server() {
        assert!(matches!(
            classify_server_error(b"MOVED notaslot 127.0.0.1:7000"),
            Error::Server { .. }
        ));
        assert!(matches!(
            classify_server_error(b"MOVED 3999"),
            Error::Server { .. }
        ));
    }

    #[test]
    fn redirect_with_ipv6_address() {
        let error = classify_server_error(b"ASK 1234 [::1]:7000");
        match error {
            Error::Ask { slot, address } => {
                assert_eq!(slot, 1234);
                assert_eq!(address, "[::1]:7000");
            }
            other => panic!("expected Ask, got {:?}", other),
        }
    }

    #[test]
    fn split_address_round_trips() {
        for addr in ["127.0.0.1:7000", "[::1]:7001", "node.local:6379"] {
            let (host, port) = split_address(addr).unwrap();
            assert_eq!(format!("{}:{}", host, port), addr);
        }
        assert!(split_address("noport").is_none());
        assert!(split_address(":7000").is_none());
    }
}
