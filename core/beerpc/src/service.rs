// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The `Foo` service every node exposes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use beerpc_rpc::{Result, Service};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Args {
    pub num1: i64,
    pub num2: i64,
}

pub struct Foo;

/// `Foo.Sum` adds the two numbers, `Foo.Sleep` does the same after
/// sleeping `num1` seconds.
pub fn foo_service() -> Result<Service> {
    Service::builder("Foo", Foo)
        .method("Sum", |_foo: Arc<Foo>, args: Args| async move {
            Ok::<_, Infallible>(args.num1 + args.num2)
        })
        .method("Sleep", |_foo: Arc<Foo>, args: Args| async move {
            tokio::time::sleep(Duration::from_secs(args.num1.max(0) as u64)).await;
            Ok::<_, Infallible>(args.num1 + args.num2)
        })
        .build()
}
