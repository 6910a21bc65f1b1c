// Database schema definitions and migrations
// This module contains the SQL schema for the audit ledger database

pub const AUDIT_LEDGER_SCHEMA: &str = include_str!("../../migrations/001_audit_ledger.sql");
