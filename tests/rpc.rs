/*!
 * RPC layer tests entry point
 */

#[path = "rpc/dispatch_test.rs"]
mod dispatch_test;

#[path = "rpc/server_test.rs"]
mod server_test;
