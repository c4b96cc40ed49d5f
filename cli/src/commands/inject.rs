//! `cainject inject` command.

use std::path::PathBuf;

use clap::Args;

use cainject_core::InjectConfig;
use cainject_runtime::{CaCertificate, Transport};

use crate::output;

#[derive(Args)]
pub struct InjectArgs {
    /// Image to read (e.g. "alpine:3.19", "oci:./layout", "oci-archive:./image.tar")
    pub source: String,

    /// Where to write the patched image, same forms as SOURCE
    pub destination: String,

    /// PEM file of the CA certificate to inject
    #[arg(long)]
    pub ca: PathBuf,

    /// Name for the CA inside the image (keystore alias, anchor file name)
    #[arg(long)]
    pub name: Option<String>,

    /// Log every tar entry of every layer read or written
    #[arg(long)]
    pub trace_layers: bool,

    /// Print only the digest of the written image
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    args: InjectArgs,
    mut config: InjectConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(name) = args.name {
        config.ca_name = name;
    }
    let trace_layers = args.trace_layers || config.trace_layers;

    let ca = CaCertificate::from_file(&args.ca)?;
    tracing::debug!(
        source = %args.source,
        destination = %args.destination,
        ca_name = %config.ca_name,
        "Starting injection"
    );
    let source = Transport::parse(&args.source)?.with_trace_layers(trace_layers);
    let destination = Transport::parse(&args.destination)?.with_trace_layers(trace_layers);

    let report = cainject_runtime::run(&source, &destination, &config, &ca).await?;

    if args.quiet {
        println!("{}", report.manifest_digest);
        return Ok(());
    }

    if report.total_patched() == 0 {
        println!("No trust stores found in {}; image copied unchanged", args.source);
    } else {
        let mut table = output::new_table(&["FORMAT", "PATH"]);
        for (format, paths) in &report.patched {
            for path in paths {
                table.add_row([format.to_string(), path.clone()]);
            }
        }
        println!("{table}");
        println!();
    }

    println!(
        "Wrote {} ({} layers, {} added, digest {})",
        args.destination,
        report.layer_count,
        report.layers_added,
        output::short_digest(&report.manifest_digest)
    );
    Ok(())
}
