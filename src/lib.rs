pub mod imaging;
pub mod server;
pub mod vision;

/// Service configuration -- constants plus the env-populated startup struct
pub mod config {
    use std::env;

    /// Model identifier loaded when `BLIP2_MODEL` is unset
    pub const DEFAULT_MODEL: &str = "Salesforce/blip2-opt-2.7b";

    /// Listen port used when `PORT` is unset or unparseable
    pub const DEFAULT_PORT: u16 = 8080;

    /// Service name reported by the health endpoint
    pub const SERVICE_NAME: &str = "BLIP-2 Image Analysis";

    /// Model label echoed in responses when the request carries none
    pub const DEFAULT_MODEL_LABEL: &str = "blip2-flan-t5-small";

    /// The fixed list reported by `/models`, independent of what is loaded
    pub const KNOWN_MODELS: [&str; 3] = [
        "Salesforce/blip2-opt-2.7b",
        "Salesforce/blip2-opt-6.7b",
        "Salesforce/blip2-flan-t5-xl",
    ];

    /// Token bound for unconditioned captions
    pub const CAPTION_MAX_TOKENS: usize = 50;

    /// Default token bound for prompted analysis
    pub const ANALYZE_MAX_TOKENS: usize = 200;

    /// Sampling temperature for prompted analysis
    pub const ANALYZE_TEMPERATURE: f64 = 0.7;

    /// Startup configuration, read from the environment exactly once. The
    /// struct is owned by the composition root and never re-read at runtime.
    #[derive(Debug, Clone)]
    pub struct Config {
        pub model: String,
        pub port: u16,
    }

    impl Config {
        pub fn from_env() -> Self {
            Config {
                model: env::var("BLIP2_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
                port: parse_port(env::var("PORT").ok()),
            }
        }
    }

    fn parse_port(raw: Option<String>) -> u16 {
        raw.and_then(|p| p.parse().ok()).unwrap_or(DEFAULT_PORT)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn port_defaults_when_unset() {
            assert_eq!(parse_port(None), DEFAULT_PORT);
        }

        #[test]
        fn port_defaults_when_unparseable() {
            assert_eq!(parse_port(Some("not-a-port".into())), DEFAULT_PORT);
        }

        #[test]
        fn port_parses() {
            assert_eq!(parse_port(Some("9000".into())), 9000);
        }
    }
}
