//! dhcp server configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default dhcpv4 addr
    pub static DEFAULT_V4_ADDR: &str = "0.0.0.0:67"; // default dhcpv4 port is 67
    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "corral-dhcp-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/var/lib/corral/config.yaml";
    /// default log level. Can use this argument or CORRAL_LOG env var
    pub const DEFAULT_CORRAL_LOG: &str = "info";
    /// default seconds between reclamation passes
    pub const DEFAULT_RECLAIM_INTERVAL: u64 = 1;

    use std::{net::SocketAddr, path::PathBuf, time::Duration};

    pub use clap::Parser;
    use dhcproto::v4;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "corral", bin_name = "corrald", about, long_about = None)]
    /// parses from cli & environment var
    pub struct Config {
        /// path to corral's config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// the v4 address to listen on
        #[clap(long, env, value_parser, default_value = DEFAULT_V4_ADDR)]
        pub v4_addr: SocketAddr,
        /// the address the control api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to num logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_CORRAL_LOG)]
        pub corral_log: String,
        /// seconds between passes of the lease reclamation task
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECLAIM_INTERVAL)]
        pub reclaim_interval: u64,
        /// Overrides db_file from the config. Use "sqlite::memory:" for in mem db
        /// NOTE: in memory sqlite db connection idle timeout is 5 mins
        #[clap(short, long, env, value_parser)]
        pub database_url: Option<String>,
    }

    impl Config {
        /// reclamation interval as `Duration`
        pub fn reclaim_interval(&self) -> Duration {
            Duration::from_secs(self.reclaim_interval)
        }

        /// are we bound to the default dhcpv4 port?
        pub fn is_default_port_v4(&self) -> bool {
            self.v4_addr.port() == v4::SERVER_PORT
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

    use std::str;

    use crate::env::parse_var_with_err;

    /// log as "json" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for tracing output
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(corral_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            // Log level comes from CORRAL_LOG
            let filter = EnvFilter::try_new(corral_log)
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
