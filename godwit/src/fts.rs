//! Full-text-search extension points.
//!
//! Tokenizers and auxiliary functions are supplied by callers as modules
//! that know how to register themselves against a raw connection; godwit
//! only stores them in the process-wide registry and replays registration on
//! every handle of a database that asked for them. Locale helpers (symbol
//! detection, normalization, pinyin, traditional-Chinese conversion) are
//! plain callbacks the modules may consult.

use std::sync::Arc;

use rusqlite::Connection;

use godwit_result::Result;

/// A tokenizer implementation registered under a name.
pub trait TokenizerModule: Send + Sync {
    /// Register the tokenizer against one connection.
    fn register(&self, conn: &Connection) -> Result<()>;
}

/// An auxiliary (scalar or ranking) function implementation.
pub trait AuxiliaryFunctionModule: Send + Sync {
    /// Register the function against one connection.
    fn register(&self, conn: &Connection) -> Result<()>;
}

pub type SymbolDetector = Arc<dyn Fn(char) -> bool + Send + Sync>;
pub type UnicodeNormalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;
pub type PinyinConverter = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;
pub type TraditionalChineseConverter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Locale helpers tokenizer modules may consult.
#[derive(Clone, Default)]
pub struct LocaleSupport {
    pub symbol_detector: Option<SymbolDetector>,
    pub unicode_normalizer: Option<UnicodeNormalizer>,
    pub pinyin_converter: Option<PinyinConverter>,
    pub traditional_chinese_converter: Option<TraditionalChineseConverter>,
}
