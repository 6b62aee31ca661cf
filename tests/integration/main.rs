//! Integration tests for the volnbd gateway.
//!
//! These verify the key architectural claims:
//! 1. Registry invariants - exactly one record per live lease, zero after release
//! 2. Recovery completeness - every stale record is reconciled and removed
//! 3. Isolation - concurrent connections cannot disturb each other's leases
//! 4. Authentication precedence - no control-plane call before a valid session
//! 5. End-to-end - a real client over TCP attaches, reads, and releases exactly once


mod acquire_release;
mod end_to_end;
