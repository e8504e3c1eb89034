//! `a3s-mirror mirror` command.

use clap::Args;

use crate::executor::{Executor, RunReport};

#[derive(Args)]
pub struct MirrorArgs {
    /// Destination: file://<path> (mirror to disk) or docker://<registry> (disk to mirror)
    pub destination: String,

    #[command(flatten)]
    pub shared: super::SharedArgs,
}

pub async fn execute(args: MirrorArgs) -> Result<(), Box<dyn std::error::Error>> {
    let opts = args.shared.to_global();
    Executor::validate(&opts, &args.destination)?;

    let quiet = opts.quiet;
    let mut executor =
        Executor::complete(opts, &args.destination)?.with_cancellation(super::interrupt_token());
    executor.prepare_storage_and_logs()?;
    let report = executor.run().await?;

    if !quiet {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    let elapsed = report.finished_at - report.started_at;
    println!(
        "Mirrored {} images ({}) in {}s",
        report.images,
        report.mode,
        elapsed.num_seconds()
    );
    if let Some(archive) = &report.archive {
        println!("Archive: {}", archive.display());
    }
    for file in &report.cluster_resources {
        println!("Cluster resource: {}", file.display());
    }
}
