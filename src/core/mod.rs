// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod completable;
pub mod config;
pub mod disposable;
pub mod error;
pub mod flowable;
pub mod maybe;
pub mod operator;
pub mod protocol;
pub mod scheduler;
pub mod single;
pub mod subscription;
pub mod testing;
