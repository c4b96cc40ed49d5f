//! `cainject scan` command.

use clap::Args;

use cainject_core::InjectConfig;
use cainject_runtime::{ScanReport, Transport};

use crate::output;

#[derive(Args)]
pub struct ScanArgs {
    /// Image to inspect, same forms as for `inject`
    pub source: String,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ScanArgs, config: InjectConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let source = Transport::parse(&args.source)?.with_trace_layers(config.trace_layers);
    let report = cainject_runtime::scan(&source, &config).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_report(&args.source, &report);
    Ok(())
}

fn print_report(source: &str, report: &ScanReport) {
    let os = match &report.os {
        Some(os) if !os.name.is_empty() => os.name.clone(),
        Some(os) => format!("{} {}", os.vendor, os.version).trim().to_string(),
        None => "unknown".to_string(),
    };
    println!("Image:   {source}");
    println!("OS:      {os}");
    println!("Layers:  {} ({} paths)", report.layers, report.entries);
    println!();

    if report.is_empty() {
        println!("No trust stores found");
        return;
    }

    let mut table = output::new_table(&["STORE", "PATH", "ACTION"]);
    for path in &report.pem_bundles {
        table.add_row(["pem-bundle", path.as_str(), "append"]);
    }
    for path in &report.java_truststores {
        table.add_row(["java", path.as_str(), "add entry"]);
    }
    if let Some(path) = &report.custom_location {
        table.add_row(["custom-location", path.as_str(), "create"]);
    }
    println!("{table}");
}
