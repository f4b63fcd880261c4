// src/handlers/mod.rs
pub mod credentials; // 🔑 API key selection
pub mod videos; // 🎬 Video generation jobs
