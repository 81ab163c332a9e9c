// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;

use beerpc::args;
use beerpc::build_info;
use beerpc::runner;

fn main() {
    let args = args::Args::parse();

    if args.version() {
        println!("{}", build_info::BUILD_INFO);
        return;
    }

    let Some(config_file) = args.config() else {
        eprintln!("beerpc: a configuration file is required, see --help");
        std::process::exit(2);
    };

    if let Err(e) = runner::run(config_file) {
        eprintln!("beerpc: {}", e);
        std::process::exit(1);
    }
}
