// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

pub struct BuildInfo {
    pub version: &'static str,
    pub git_sha: &'static str,
    pub profile: &'static str,
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version: {}, git_sha: {}, profile: {}",
            self.version, self.git_sha, self.profile
        )
    }
}

pub const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    git_sha: match option_env!("BEERPC_GIT_SHA") {
        Some(sha) => sha,
        None => "unknown",
    },
    profile: if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    },
};
