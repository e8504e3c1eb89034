//! `a3s-mirror prepare` command.

use clap::Args;

use crate::executor::Executor;

#[derive(Args)]
pub struct PrepareArgs {
    #[command(flatten)]
    pub shared: super::SharedArgs,
}

pub async fn execute(args: PrepareArgs) -> Result<(), Box<dyn std::error::Error>> {
    let opts = args.shared.to_global();
    Executor::validate_prepare(&opts)?;

    let quiet = opts.quiet;
    let mut executor =
        Executor::complete_prepare(opts)?.with_cancellation(super::interrupt_token());
    executor.prepare_storage_and_logs()?;
    let report = executor.run().await?;

    if !quiet {
        println!("All {} images are available in the local cache", report.images);
        if let Some(path) = &report.cached_images_report {
            println!("Full list: {}", path.display());
        }
    }
    Ok(())
}
