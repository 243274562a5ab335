// Single integration test binary; scenarios run against the in-memory broker in `support`.

mod support;

mod connection_test;
