//! `cainject hash` command.

use std::path::PathBuf;

use clap::Args;

use cainject_runtime::CaCertificate;

#[derive(Args)]
pub struct HashArgs {
    /// PEM certificate file
    pub cert: PathBuf,
}

pub async fn execute(args: HashArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ca = CaCertificate::from_file(&args.cert)?;
    println!("{}", ca.subject_hash()?);
    Ok(())
}
