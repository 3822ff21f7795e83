//! Shared test fixtures (used by unit, functional and integration tests).
