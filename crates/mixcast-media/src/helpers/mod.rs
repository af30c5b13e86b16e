// crates/mixcast-media/src/helpers/mod.rs

pub mod yuv;
