// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "beeRPC node", long_about = None, disable_version_flag = true)]
pub struct Args {
    /// Node configuration file
    #[arg(short, long, value_name = "FILE", env = "BEERPC_CONFIG")]
    config: Option<String>,

    /// Print build information and exit
    #[arg(short = 'V', long)]
    version: bool,
}

impl Args {
    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }

    pub fn version(&self) -> bool {
        self.version
    }
}
