mod filesystem;

pub use filesystem::SpanFuse;
