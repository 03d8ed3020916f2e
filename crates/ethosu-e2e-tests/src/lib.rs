//! End-to-end tests for the Ethos-U pipeline. See `tests/`.
