// Test modules for upnp-nat
// Each module holds the unit tests of the corresponding source file

mod device_tests;
mod support;
