use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mediaproc-shell", about = "Out-of-process media host shell")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/mediaproc.toml")]
    pub config: String,

    /// Run media on a thread of this process (overrides config)
    #[arg(long)]
    pub in_process: bool,

    /// Print the media log as JSON before exiting
    #[arg(long)]
    pub dump_log: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a URL through the media process for a while, logging player events
    Play {
        url: String,

        /// How long to play before releasing the player
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}
