pub mod root_harness;
