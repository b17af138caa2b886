//! System tests for `tether-amqp`, run against the in-memory broker of
//! `tether-memory`. See the `tests` directory.
