// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run vmapi, the VM lifecycle control plane

use anyhow::anyhow;
use clap::Parser;
use std::path::PathBuf;
use vmapi::Config;

#[derive(Debug, Parser)]
#[clap(name = "vmapi", about = "VM lifecycle control-plane API")]
struct Args {
    #[clap(name = "CONFIG_FILE_PATH")]
    config_file_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = Config::from_file(&args.config_file_path)
        .map_err(|error| anyhow!(error))?;
    vmapi::run_server(&config).await.map_err(|error| anyhow!(error))
}
