// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod args;
pub mod build_info;
pub mod config;
pub mod runner;
pub mod runtime;
pub mod service;
pub mod signal;
