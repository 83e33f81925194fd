#[cfg(test)]
mod tests {
    use kube_tunnel::error::TunnelError;
    use std::time::Duration;

    #[test]
    fn test_ready_timeout_message() {
        let err = TunnelError::ReadyTimeout {
            target: "e2e-agent/e2e-proxy-0 port 30000".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "tunnel to e2e-agent/e2e-proxy-0 port 30000 was not ready within 30s"
        );
    }

    #[test]
    fn test_all_candidates_failed_lists_every_error() {
        let err = TunnelError::AllCandidatesFailed {
            service: "metrics/prometheus".to_string(),
            errors: vec![
                "metrics/prometheus-0: connection error: refused".to_string(),
                "metrics/prometheus-1: connection error: refused".to_string(),
            ],
        };
        let message = err.to_string();
        assert!(
            message.starts_with("no pod backing service metrics/prometheus could be forwarded")
        );
        assert!(message.contains("prometheus-0"));
        assert!(message.contains("prometheus-1"));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            TunnelError::NotFound("no pod named e2e-proxy*".to_string()).to_string(),
            "not found: no pod named e2e-proxy*"
        );
        assert_eq!(
            TunnelError::ConnectionError("stream closed".to_string()).to_string(),
            "connection error: stream closed"
        );
        assert_eq!(
            TunnelError::ConfigError("Invalid DNS name format".to_string()).to_string(),
            "configuration error: Invalid DNS name format"
        );
    }

    #[test]
    fn test_error_conversions() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: TunnelError = io.into();
        assert!(matches!(err, TunnelError::Io(_)));

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: TunnelError = json.into();
        assert!(matches!(err, TunnelError::DecodeError(_)));
        assert!(err.to_string().starts_with("invalid proxy response"));
    }
}
