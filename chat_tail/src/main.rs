use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use std::path::PathBuf;
use std::time::Duration;

mod tail;

use crate::tail::{Filters, Follower, render_line, tail_lines};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(
    name = "chat-tail",
    about = "Tail and format chat messages from the multichat JSON log"
)]
struct Args {
    /// Keep printing new messages as they are logged (like tail -f)
    #[arg(short, long)]
    follow: bool,

    /// Number of lines to show from the end of the log
    #[arg(short = 'n', long, default_value_t = 10)]
    lines: usize,

    /// Only show messages from this channel
    #[arg(long)]
    channel: Option<String>,

    /// Only show messages from this author
    #[arg(long)]
    author: Option<String>,

    /// Path to the JSON log written by multichat
    #[arg(long, default_value = "logs/multichat.log")]
    log: PathBuf,
}

fn print_matching(lines: &[String], filters: &Filters) {
    for line in lines {
        if let Some(rendered) = render_line(line, filters) {
            println!("{}", rendered);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    if !args.log.exists() {
        eprintln!("Log file not found: {}", args.log.display());
        std::process::exit(1);
    }

    let filters = Filters {
        channel: args.channel.filter(|c| !c.is_empty()),
        author: args.author.filter(|a| !a.is_empty()),
    };

    let snapshot = tail_lines(&args.log, args.lines)
        .wrap_err_with(|| format!("Failed to read {}", args.log.display()))?;
    print_matching(&snapshot.lines, &filters);
    if !args.follow {
        return Ok(());
    }

    let mut follower = Follower::open(&args.log, snapshot.end_offset)
        .wrap_err_with(|| format!("Failed to open {}", args.log.display()))?;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("\nStopping follow.");
                return Ok(());
            }
            _ = ticker.tick() => {
                let lines = follower
                    .poll()
                    .wrap_err_with(|| format!("Failed to follow {}", args.log.display()))?;
                print_matching(&lines, &filters);
            }
        }
    }
}
