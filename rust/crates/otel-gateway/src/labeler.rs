//! A bag of extra metric attributes that handlers can fill in.

use std::sync::{Arc, Mutex, PoisonError};

use opentelemetry::{Context, KeyValue};

/// Extra attributes for the metrics of the request being served.
///
/// Clones share the same entries, so attributes added by a handler are seen
/// by the middleware that created the labeler.
#[derive(Clone, Debug, Default)]
pub struct Labeler {
    attributes: Arc<Mutex<Vec<KeyValue>>>,
}

impl Labeler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends attributes. Nothing is deduplicated.
    pub fn add(&self, attributes: impl IntoIterator<Item = KeyValue>) {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(attributes);
    }

    /// The attributes added so far, in the order they were added.
    pub fn get(&self) -> Vec<KeyValue> {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct LabelerKey(Labeler);

/// Returns a copy of `parent` carrying `labeler`.
pub fn context_with_labeler(parent: &Context, labeler: Labeler) -> Context {
    parent.with_value(LabelerKey(labeler))
}

/// Returns the labeler carried by `cx`, or a new one.
///
/// The flag is `true` if the labeler came from the context.
pub fn labeler_from_context(cx: &Context) -> (Labeler, bool) {
    match cx.get::<LabelerKey>() {
        Some(LabelerKey(labeler)) => (labeler.clone(), true),
        None => (Labeler::new(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_labeler_is_created() {
        let (labeler, found) = labeler_from_context(&Context::new());

        assert!(!found);
        assert!(labeler.get().is_empty());
    }

    #[test]
    fn context_shares_the_bag() {
        let labeler = Labeler::new();
        let cx = context_with_labeler(&Context::new(), labeler.clone());

        let (from_context, found) = labeler_from_context(&cx);
        from_context.add([KeyValue::new("tenant", "acme")]);
        from_context.add([KeyValue::new("tenant", "acme")]);

        assert!(found);
        assert_eq!(
            labeler.get(),
            vec![KeyValue::new("tenant", "acme"), KeyValue::new("tenant", "acme")]
        );
    }
}
