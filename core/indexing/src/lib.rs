pub mod embedding;
pub mod error;
pub mod lexical;
pub mod tokenizer;
pub mod vector;

pub use embedding::{
    embedder_from_env, EmbeddingBackend, HashingEmbedder, OllamaEmbedder, DEFAULT_DIMENSION,
};
pub use error::{BackendError, IndexError};
pub use lexical::{jaccard, LexicalHit, LexicalIndex, LexicalMode, RankHints};
pub use tokenizer::{fallback_terms, normalize, NullTokenizer, Tokenizer, WordTokenizer, STOPWORDS};
pub use vector::{cosine_similarity, VectorHit, VectorIndex};
