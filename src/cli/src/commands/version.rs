//! `a3s-mirror version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("a3s-mirror version {}", a3s_mirror_core::VERSION);
    Ok(())
}
