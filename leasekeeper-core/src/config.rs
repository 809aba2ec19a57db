//! leasekeeper process configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "leasekeeper-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/var/lib/leasekeeper/config.yaml";
    /// default instance id
    pub const DEFAULT_INSTANCE_ID: &str = "leasekeeper_id";
    /// default log level. Can use this argument or LEASEKEEPER_LOG env var
    pub const DEFAULT_LEASEKEEPER_LOG: &str = "info";

    use std::{net::SocketAddr, path::PathBuf};

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "leasekeeper", bin_name = "leasekeeper", about, long_about = None)]
    /// parses from cli & environment var. leasekeeper will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to leasekeeper's config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// the address the external api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of tokio worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// ID of this instance
        #[clap(long, env, value_parser, default_value = DEFAULT_INSTANCE_ID)]
        pub instance_id: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_LEASEKEEPER_LOG)]
        pub leasekeeper_log: String,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_cli_defaults() {
            let cfg = Config::parse_from(["leasekeeper"]);
            assert_eq!(cfg.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
            assert_eq!(cfg.external_api.port(), 3333);
            assert_eq!(cfg.thread_name, DEFAULT_THREAD_NAME);
            assert!(cfg.threads.is_none());
        }

        #[test]
        fn test_cli_overrides() {
            let cfg = Config::parse_from([
                "leasekeeper",
                "--config-path",
                "/tmp/lk.yaml",
                "--external-api",
                "127.0.0.1:9999",
                "--threads",
                "2",
            ]);
            assert_eq!(cfg.config_path, PathBuf::from("/tmp/lk.yaml"));
            assert_eq!(cfg.external_api, "127.0.0.1:9999".parse().unwrap());
            assert_eq!(cfg.threads, Some(2));
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for the global tracing subscriber
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber, log level comes from LEASEKEEPER_LOG
        pub fn parse(leasekeeper_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            let filter = EnvFilter::try_new(leasekeeper_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
