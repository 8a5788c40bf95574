#![expect(clippy::unwrap_used)]
mod common;
mod selection;
mod valkey_buckets;
