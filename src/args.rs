//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Collector endpoint receiving PSD frames
    #[clap(short, long)]
    pub collector: String,
    /// Endpoint serving acquisition parameters for this node
    #[clap(short, long)]
    pub params: String,
    /// Device identifier reported with every frame (MAC address)
    #[clap(short, long, value_parser = valid_mac)]
    pub device_id: String,
    /// Measurement campaign tag attached to every frame
    #[clap(long)]
    pub campaign: Option<String>,
    /// Command that launches the acquisition engine bridge
    #[clap(short, long, default_value = "sweep-engine")]
    pub engine_cmd: String,
    /// Directory holding frames queued for redelivery
    #[clap(long, default_value = "/var/lib/spectrum_courier/queue")]
    pub queue_dir: PathBuf,
    /// Directory holding the archive of delivered frames
    #[clap(long, default_value = "/var/lib/spectrum_courier/historic")]
    pub historic_dir: PathBuf,
    /// Shared state file for cross-process values
    #[clap(long, default_value = "/var/lib/spectrum_courier/state.json")]
    pub store: PathBuf,
    /// Seconds between acquisition cycles
    #[clap(long, default_value_t = 60)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub cadence: u64,
    /// Seconds between retry-queue passes
    #[clap(long, default_value_t = 300)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub retry_interval: u64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn valid_mac(s: &str) -> Result<String, String> {
    let octets: Vec<&str> = s.split(':').collect();
    if octets.len() == 6 && octets.iter().all(|o| o.len() == 2 && u8::from_str_radix(o, 16).is_ok())
    {
        Ok(s.to_lowercase())
    } else {
        Err("expected a MAC address like aa:bb:cc:dd:ee:ff".to_string())
    }
}
