//! Built-in map/reduce applications. The runtime only ever sees these as
//! opaque callables.

/// Word count: map emits `(word, "1")` per whitespace-separated word, reduce
/// counts the values collected for a word.
pub mod wc {
    use crate::mr::layout::KeyValue;

    pub fn map(_input_file: &str, contents: &str) -> Vec<KeyValue> {
        contents
            .split_whitespace()
            .map(|word| KeyValue::new(word, "1"))
            .collect()
    }

    pub fn reduce(_key: &str, values: &[String]) -> String {
        values.len().to_string()
    }
}
