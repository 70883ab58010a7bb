//! facewatch-store: SQLite persistence for enrolled identities and recognition events.

pub mod store;

pub use store::{EventSink, FaceStore, GallerySource, RecognitionEvent, StoreError};
