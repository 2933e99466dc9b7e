//! # docsync
//!
//! Scheduled ingestion of shared-drive documents into vector collections.
//!
//! Each configured document class (regulation JSON, procedure PDFs, case
//! spreadsheets, general files) lives in one folder of a Microsoft Graph
//! drive and maps to one Qdrant collection. A run lists the files changed
//! since the class checkpoint, extracts and decodes them into records,
//! fingerprints each record, and embeds and upserts only what changed.
//! The vector store doubles as the fingerprint store, so an interrupted run
//! resumes without redoing finished work.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │ Graph drive│──▶│ Extract/OCR  │──▶│ Fingerprint│──▶│  Embed   │
//! │  (listing) │   │ + decode     │   │  + exists  │   │ + upsert │
//! └────────────┘   └──────────────┘   └────────────┘   └────┬─────┘
//!                                                           ▼
//!  ┌───────────┐    ┌─────────────┐                    ┌──────────┐
//!  │ Scheduler │───▶│ run log     │                    │  Qdrant  │
//!  │ (locks)   │    │ (SQLite)    │                    └──────────┘
//!  └─────┬─────┘    └─────────────┘
//!        ▼
//!  ┌──────────┐
//!  │ HTTP API │
//!  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, per-class resolution |
//! | [`traits`] | `DocumentSource` and `TextExtractor` seams |
//! | [`classes`] | Document classes: routing and record decoding |
//! | [`connector_graph`] | Microsoft Graph drive listing and download |
//! | [`extract`] | Local text extraction (PDF text layer, spreadsheets) |
//! | [`ocr`] | OCR service client |
//! | [`embedding`] | Gemini / OpenAI embedding providers |
//! | [`qdrant`] | Qdrant vector index |
//! | [`ingest`] | The per-class pipeline (`sync_and_upsert`) |
//! | [`retry`] | Backoff shared by the HTTP clients |
//! | [`progress`] | CLI progress on stderr |
//! | [`runlog`] | Run history and checkpoints |
//! | [`scheduler`] | Per-class timers and run locks |
//! | [`server`] | Operator HTTP API |
//! | [`pipelines`] | Building pipelines from configuration |
//! | [`commands`] | CLI command implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod classes;
pub mod commands;
pub mod config;
pub mod connector_graph;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod ocr;
pub mod pipelines;
pub mod progress;
pub mod qdrant;
pub mod retry;
pub mod runlog;
pub mod scheduler;
pub mod server;
pub mod traits;
