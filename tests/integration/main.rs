//! Integration tests: full decision cycles against a fault-injecting
//! mock brokerage.

mod mock_gateway;
mod scenarios;
