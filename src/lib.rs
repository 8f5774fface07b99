//! Content resolution and archive extraction for software inventory cataloging.
//!
//! The crate answers one question for the catalogers built on top of it: "give me this file,
//! wherever it lives".  A file may live in a plain directory tree, in the squashed view of a
//! container image, in one specific layer of that image, or inside arbitrarily nested archives.
//! All of those are hidden behind the [`source::FileResolver`] trait and the
//! [`source::Location`] identity model.
//!
//! The [`archive`] module holds the defensive archive handling: the ZIP end-of-central-directory
//! locator (including ZIP64 and prepended data), bounded extraction into unique temporary files,
//! zip-slip protection and nested-archive discovery.

pub mod archive;
pub mod cataloger;
pub mod config;
pub mod error;
pub mod image;
pub mod source;
pub mod tree;
pub mod util;

#[cfg(test)]
pub mod test;

/// Regular files with this many bytes or fewer are kept in memory when an image is loaded.  Larger
/// files are spilled into the image's scratch directory.
pub const INLINE_CONTENT_MAX: usize = 4096;
