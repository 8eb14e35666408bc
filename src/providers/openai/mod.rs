mod adapter;
mod models;
mod stream;

pub use adapter::OpenAiProvider;
