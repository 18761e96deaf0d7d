pub mod template_cache;

pub use template_cache::TemplateCache;
