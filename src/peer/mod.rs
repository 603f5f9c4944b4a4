//! TCP peer protocol: the BitTorrent handshake (BEP 3), the extension
//! protocol (BEP 10), and the ut_metadata metadata exchange (BEP 9).
pub mod fetcher;
pub mod handshake;
pub mod message;
#[cfg(test)]
pub mod seeder;

pub use fetcher::{fetch_metadata, FetchError};

/// BEP 9 transfers the info dict in fixed 16 KiB slices; only the last
/// piece may be shorter.
pub const METADATA_PIECE_LEN: usize = 16384;

/// The extended message id this client assigns to ut_metadata when
/// advertising it; peers address their ut_metadata traffic to us with it.
pub const UT_METADATA_LOCAL_ID: u8 = 1;
