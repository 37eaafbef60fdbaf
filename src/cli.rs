use std::path::PathBuf;

use clap::Parser;

use crate::config::Overrides;
use crate::types::SocketSpec;

#[derive(Parser, Debug)]
#[command(
    name = "amon-relay",
    about = "The Amon relay server.",
    long_about = "The Amon relay server. Relays probe configuration from the Amon master \
                  to agents in each zone on this compute node."
)]
pub struct Cli {
    /// Once for DEBUG log output. Twice for TRACE.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to a directory to use for working data storage. This is all
    /// cache data, i.e. can be restored.
    /// [default: /var/run/smartdc/amon-relay]
    #[arg(short = 'D', long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// The Amon Master API base url. Discovered through MAPI if not given.
    #[arg(short, long, value_name = "MASTER-URL")]
    pub master_url: Option<String>,

    /// UUID of this compute node. Read from `sysinfo` if not given.
    #[arg(short = 'n', long, value_name = "UUID")]
    pub compute_node_uuid: Option<String>,

    /// The frequency to poll the master for agent probes update. [default: 30]
    #[arg(short, long, value_name = "SECONDS")]
    pub poll: Option<u64>,

    /// The socket path on which to listen, inside each target zone. For
    /// development this may be a port number.
    /// [default: /var/run/.smartdc-amon.sock]
    #[arg(short, long, value_name = "PATH")]
    pub socket: Option<SocketSpec>,

    /// Setup socket in all zones. By default we only listen in the current
    /// zone (presumed to be the global). Incompatible with a port number
    /// for '-s'.
    #[arg(short = 'Z', long)]
    pub all_zones: bool,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            data_dir: self.data_dir.clone(),
            master_url: self.master_url.clone(),
            compute_node_uuid: self.compute_node_uuid.clone(),
            poll: self.poll,
            socket: self.socket.clone(),
            all_zones: self.all_zones,
        }
    }

    pub fn log_level(&self) -> Option<log::LevelFilter> {
        match self.verbose {
            0 => None,
            1 => Some(log::LevelFilter::Debug),
            _ => Some(log::LevelFilter::Trace),
        }
    }
}
