//! Calculator catalog indexed by input stream.

use crate::calculators::Calculator;
use crate::error::RegistryError;
use tracing::{error, info};

/// Calculators sharing one input stream, in registration order.
///
/// The first calculator registered for the input fixes the output stream.
pub struct CalculatorGroup {
    input_stream: String,
    output_stream: String,
    calculators: Vec<Box<dyn Calculator>>,
}

impl CalculatorGroup {
    pub fn input_stream(&self) -> &str {
        &self.input_stream
    }

    pub fn output_stream(&self) -> &str {
        &self.output_stream
    }

    pub fn calculators(&self) -> &[Box<dyn Calculator>] {
        &self.calculators
    }

    pub fn len(&self) -> usize {
        self.calculators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calculators.is_empty()
    }
}

/// Groups are kept in the order their input stream was first seen, so a
/// cycle always visits streams in a stable order.
#[derive(Default)]
pub struct EnrichmentRegistry {
    groups: Vec<CalculatorGroup>,
}

impl EnrichmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every calculator, logging and skipping the rejected ones.
    pub fn from_calculators(calculators: impl IntoIterator<Item = Box<dyn Calculator>>) -> Self {
        let mut registry = Self::new();
        for calculator in calculators {
            // Rejections are already logged by `register`.
            let _ = registry.register(calculator);
        }
        registry
    }

    pub fn register(&mut self, calculator: Box<dyn Calculator>) -> Result<(), RegistryError> {
        let name = calculator.name().to_string();
        let result = self.try_register(calculator);
        match &result {
            Ok(()) => info!(calculator = %name, "registered calculator"),
            Err(e) => error!(calculator = %name, error = %e, "rejected calculator"),
        }
        result
    }

    fn try_register(&mut self, calculator: Box<dyn Calculator>) -> Result<(), RegistryError> {
        let name = calculator.name();
        let input = calculator
            .input_stream()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RegistryError::MissingInputStream(name.to_string()))?
            .to_string();
        let output = calculator
            .output_stream()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RegistryError::MissingOutputStream(name.to_string()))?
            .to_string();

        match self.groups.iter_mut().find(|g| g.input_stream == input) {
            Some(group) if group.output_stream != output => Err(RegistryError::OutputMismatch {
                name: name.to_string(),
                input,
                declared: output,
                expected: group.output_stream.clone(),
            }),
            Some(group) => {
                group.calculators.push(calculator);
                Ok(())
            }
            None => {
                self.groups.push(CalculatorGroup {
                    input_stream: input,
                    output_stream: output,
                    calculators: vec![calculator],
                });
                Ok(())
            }
        }
    }

    /// Calculators for `input_stream` in registration order; empty if none.
    pub fn get_calculators(&self, input_stream: &str) -> &[Box<dyn Calculator>] {
        self.group(input_stream)
            .map(CalculatorGroup::calculators)
            .unwrap_or(&[])
    }

    pub fn group(&self, input_stream: &str) -> Option<&CalculatorGroup> {
        self.groups.iter().find(|g| g.input_stream == input_stream)
    }

    pub fn groups(&self) -> &[CalculatorGroup] {
        &self.groups
    }

    pub fn input_streams(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.input_stream.as_str())
    }

    /// True when no input stream has any calculator.
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(CalculatorGroup::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculators::EnrichContext;
    use crate::error::CalculatorError;
    use crate::record::{FieldMap, RawRecord};
    use async_trait::async_trait;

    struct Declared {
        name: &'static str,
        input: Option<&'static str>,
        output: Option<&'static str>,
    }

    #[async_trait]
    impl Calculator for Declared {
        fn name(&self) -> &str {
            self.name
        }

        fn input_stream(&self) -> Option<&str> {
            self.input
        }

        fn output_stream(&self) -> Option<&str> {
            self.output
        }

        async fn enrich(
            &self,
            _record: &RawRecord,
            _ctx: &EnrichContext,
        ) -> Result<Option<FieldMap>, CalculatorError> {
            Ok(None)
        }
    }

    fn calc(
        name: &'static str,
        input: Option<&'static str>,
        output: Option<&'static str>,
    ) -> Box<dyn Calculator> {
        Box::new(Declared { name, input, output })
    }

    #[test]
    fn test_groups_by_input_in_registration_order() {
        let registry = EnrichmentRegistry::from_calculators(vec![
            calc("a", Some("Sleep"), Some("EnrichedSleep")),
            calc("b", Some("VO2"), Some("EnrichedVO2")),
            calc("c", Some("Sleep"), Some("EnrichedSleep")),
        ]);

        let names: Vec<&str> = registry
            .get_calculators("Sleep")
            .iter()
            .map(|c| c.name())
            .collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(registry.input_streams().collect::<Vec<_>>(), vec!["Sleep", "VO2"]);
        assert_eq!(registry.group("VO2").unwrap().output_stream(), "EnrichedVO2");
        assert!(registry.get_calculators("Unknown").is_empty());
    }

    #[test]
    fn test_rejects_missing_output_and_keeps_loading() {
        let mut registry = EnrichmentRegistry::new();
        assert_eq!(
            registry.register(calc("no-output", Some("Sleep"), None)),
            Err(RegistryError::MissingOutputStream("no-output".into()))
        );
        assert_eq!(
            registry.register(calc("no-input", None, Some("EnrichedSleep"))),
            Err(RegistryError::MissingInputStream("no-input".into()))
        );
        assert!(registry.is_empty());

        assert!(registry.register(calc("ok", Some("Sleep"), Some("EnrichedSleep"))).is_ok());
        assert!(!registry.is_empty());
        assert_eq!(registry.get_calculators("Sleep").len(), 1);
    }

    #[test]
    fn test_rejects_output_mismatch_within_group() {
        let registry = EnrichmentRegistry::from_calculators(vec![
            calc("first", Some("Sleep"), Some("EnrichedSleep")),
            calc("stray", Some("Sleep"), Some("Elsewhere")),
        ]);
        let group = registry.group("Sleep").unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group.output_stream(), "EnrichedSleep");

        let mut registry = registry;
        assert_eq!(
            registry.register(calc("stray", Some("Sleep"), Some("Elsewhere"))),
            Err(RegistryError::OutputMismatch {
                name: "stray".into(),
                input: "Sleep".into(),
                declared: "Elsewhere".into(),
                expected: "EnrichedSleep".into(),
            })
        );
    }
}
