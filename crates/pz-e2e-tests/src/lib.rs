//! End-to-end tests for the PZEM gateway live in `tests/`.
//!
//! They wire the agent components to one `MockChannel` and drive the
//! session through connect, command, telemetry and reconnect sequences.
