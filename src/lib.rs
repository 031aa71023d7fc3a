//! # ocibuild
//!
//! **Daemonless OCI image construction for function project source trees**
//!
//! This crate builds an OCI-compliant container image directly from a
//! project directory, without delegating to an external container-build
//! daemon: symlink-escape-safe tree traversal, deterministic layer
//! construction, content-addressable blob storage, per-platform
//! config/manifest assembly, multi-platform index construction, and
//! export to an OCI layout directory or a remote registry.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           ocibuild                             │
//! ├────────────────────────────────────────────────────────────────┤
//! │  Builder (platform matrix orchestration)                       │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────────┐   │
//! │  │ walk         │ → │ layer        │ → │ image (assembly)  │   │
//! │  │ validate tree│   │ tar+gzip,    │   │ config + manifest │   │
//! │  │ reject       │   │ dual digests │   │ per platform      │   │
//! │  │ escapes      │   └──────┬───────┘   └─────────┬─────────┘   │
//! │  └──────────────┘          │                     │             │
//! │                     ┌──────┴─────────────────────┴──────┐      │
//! │                     │   BlobStore (content-addressed)   │      │
//! │                     └──────┬─────────────────────┬──────┘      │
//! │                            │                     │             │
//! │               ┌────────────┴──────┐   ┌──────────┴──────────┐  │
//! │               │ OCI layout export │   │ registry push       │  │
//! │               │ (local directory) │   │ (pluggable          │  │
//! │               │                   │   │  transport + creds) │  │
//! │               └───────────────────┘   └─────────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! - **Symlink escape prevention**: every symlink in the project tree
//!   is validated before inclusion; absolute targets and targets that
//!   resolve outside the project root fail the whole build (see
//!   [`walk::validate_symlink`]). This prevents the "tar-slip" class
//!   of defect where extracting a layer overwrites files outside the
//!   intended container filesystem.
//! - **Digest binding**: blob digests are computed from content, never
//!   assigned; read-back verification surfaces corruption as a fatal
//!   integrity error.
//! - **Bounded resources**: entry counts and layer sizes are limited
//!   by [`constants`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use ocibuild::{BlobStore, Builder, BuildRequest, Platform, ScratchResolver};
//!
//! #[tokio::main]
//! async fn main() -> ocibuild::Result<()> {
//!     let store = Arc::new(BlobStore::new()?);
//!     let builder = Builder::new(store.clone(), Arc::new(ScratchResolver));
//!
//!     let mut request = BuildRequest::new("./hello-func", "scratch");
//!     request.platforms = vec![
//!         Platform::parse("linux/amd64")?,
//!         Platform::parse("linux/arm64")?,
//!     ];
//!
//!     let built = builder.build(&request, &CancellationToken::new()).await?;
//!     ocibuild::export::write_oci_layout(&store, &built, "./image".as_ref())?;
//!     Ok(())
//! }
//! ```

pub mod build;
pub mod constants;
pub mod error;
pub mod export;
pub mod image;
pub mod layer;
pub mod manifest;
pub mod platform;
pub mod registry;
pub mod storage;
pub mod walk;

// Re-exports
pub use build::{BaseResolver, BuildRequest, Builder, BuiltImage, ScratchResolver, StaticBaseResolver};
pub use error::{Error, Result};
pub use export::{write_oci_layout, Pusher};
pub use image::{AssembledImage, BaseImage, RuntimeOverrides};
pub use layer::{Layer, LayerBuilder};
pub use manifest::{Descriptor, ImageConfig, ImageIndex, ImageManifest, PlatformSpec};
pub use platform::{Arch, Os, Platform};
pub use registry::{
    Anonymous, CredentialSource, Credentials, HttpTransport, Reference, RegistryTransport,
    StaticCredentials, TransportError,
};
pub use storage::{BlobStore, Digest};
pub use walk::{collect_entries, validate_symlink, EntryKind, FileEntry};
