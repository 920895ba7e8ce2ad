use anyhow::Context;
use scanfleet_report::merge_files;

use crate::commands::MergeArgs;

pub fn merge(args: MergeArgs) -> anyhow::Result<()> {
    let xml: String = merge_files(
        &args.base,
        args.enrichment.as_deref(),
        &args.ip.to_string(),
        &args.hostnames,
    )
    .with_context(|| format!("merging {}", args.base.display()))?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, xml).with_context(|| format!("writing {}", path.display()))?
        }
        None => print!("{xml}"),
    }
    Ok(())
}
