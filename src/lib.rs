// Shardpool: master process for a pool of sharded-compute workers.
//
// The library carries all server modules so the master binary, the watchdog
// binary and integration tests share one implementation.

pub mod web;
