//! # m365-rag
//!
//! Delta-sync Microsoft 365 mail and OneDrive documents into an OpenAI vector
//! store, and answer questions over them through the Responses API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Connectors  │──▶│   Pipeline   │──▶│ Batch JSONL  │
//! │ Mail/Drive/FS│   │ classify+norm│   │  + SQLite    │
//! └──────────────┘   └──────┬───────┘   └──────────────┘
//!                           │
//!                           ▼
//!                  ┌──────────────────┐        ┌──────────┐
//!                  │ OpenAI files +   │◀──────▶│ /ask /rag│
//!                  │ vector store     │        │  (mrag)  │
//!                  └──────────────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mrag init                       # create database
//! mrag sources                    # check credentials and folders
//! mrag sync all                   # mail + onedrive delta sync and upload
//! mrag ask "What did Alice say about the Q2 budget?"
//! mrag serve                      # /ask and /rag relay
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`auth`] | Azure AD client-credentials token cache |
//! | [`graph`] | Microsoft Graph client (mail, drive) |
//! | [`connector_mail`] | Mailbox delta connector |
//! | [`connector_onedrive`] | OneDrive delta connector |
//! | [`connector_fs`] | Local folder connector |
//! | [`extract`] | PDF / Office / HTML text extraction |
//! | [`record`] | Normalized record metadata and naming |
//! | [`ingest`] | Delta-sync pipeline |
//! | [`archive`] | OneDrive archive folder maintenance |
//! | [`vector_store`] | OpenAI files and vector store client |
//! | [`answer`] | Responses API question answering |
//! | [`server`] | HTTP relay |
//! | [`db`] | Database connection and record state |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod archive;
pub mod auth;
pub mod batch;
pub mod config;
pub mod connector_fs;
pub mod connector_mail;
pub mod connector_onedrive;
pub mod db;
pub mod error;
pub mod export;
pub mod extract;
pub mod get;
pub mod graph;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod record;
pub mod search;
pub mod server;
pub mod sources;
pub mod stats;
pub mod text;
pub mod traits;
pub mod upload_cmd;
pub mod vector_store;
