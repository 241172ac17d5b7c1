#[cfg(test)]
mod tests {
    use crate::Args;
    use clap::Parser;
    use std::time::Duration;

    #[test]
    fn test_args_default_values() {
        let args = Args::try_parse_from(["classify-proxy-router"]).unwrap();

        assert_eq!(args.max_batch_requests, 5);
        assert_eq!(args.max_retries, 3);
        assert_eq!(args.request_timeout_ms, 30000);
        assert_eq!(args.wait_timeout_ms, 30000);
        assert_eq!(args.rate_limit_backoff_ms, 100);
        assert_eq!(args.failure_backoff_ms, 50);
        assert_eq!(args.max_concurrent_requests, 512);
        assert_eq!(args.payload_limit, 2000000);
        assert_eq!(args.otlp_service_name, "classify-proxy.server");
        assert!(!args.json_output);
        assert!(args.cors_allow_origin.is_none());
    }

    #[test]
    fn test_args_batching_config() {
        let args = Args::try_parse_from([
            "classify-proxy-router",
            "--max-batch-requests",
            "8",
            "--max-retries",
            "5",
            "--request-timeout-ms",
            "1500",
            "--rate-limit-backoff-ms",
            "250",
            "--failure-backoff-ms",
            "20",
        ])
        .unwrap();

        let config = args.batching_config();
        assert_eq!(config.max_batch_requests, 8);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.rate_limit_backoff, Duration::from_millis(250));
        assert_eq!(config.failure_backoff, Duration::from_millis(20));
    }

    #[test]
    fn test_args_downstream_urls() {
        let args = Args::try_parse_from([
            "classify-proxy-router",
            "--downstream-url",
            "http://classifier:8080/v1/classify",
            "--downstream-health-url",
            "http://classifier:8080/health",
        ])
        .unwrap();

        assert_eq!(args.downstream_url, "http://classifier:8080/v1/classify");
        assert_eq!(
            args.downstream_health_url.as_deref(),
            Some("http://classifier:8080/health")
        );
    }

    #[test]
    fn test_args_cors_allow_origin() {
        let args = Args::try_parse_from([
            "classify-proxy-router",
            "--cors-allow-origin",
            "http://a.example",
            "--cors-allow-origin",
            "http://b.example",
        ])
        .unwrap();

        assert_eq!(
            args.cors_allow_origin,
            Some(vec![
                "http://a.example".to_string(),
                "http://b.example".to_string()
            ])
        );
    }

    #[test]
    fn test_args_reject_invalid_numbers() {
        assert!(
            Args::try_parse_from(["classify-proxy-router", "--max-batch-requests", "five"])
                .is_err()
        );
        assert!(Args::try_parse_from(["classify-proxy-router", "--max-retries", "-1"]).is_err());
        assert!(Args::try_parse_from(["classify-proxy-router", "--port", "70000"]).is_err());
    }
}
