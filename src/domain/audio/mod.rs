//! Audio domain - sound resources played into calls

pub mod uri;

pub use uri::SoundUri;
