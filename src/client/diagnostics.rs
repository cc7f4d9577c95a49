//! Diagnostic sampling of outgoing telemetry.

use uuid::Uuid;

use crate::message::Message;

const DIAGNOSTIC_ID_PROPERTY: &str = "diag-id";
const DIAGNOSTIC_CREATION_TIME_PROPERTY: &str = "diag-creation-time-utc";

/// Decides which outgoing messages get diagnostic annotations.
///
/// The sampling percentage selects exactly `percentage` messages out of
/// every 100, spread evenly over the sequence by a step function on the
/// monotone message counter.
#[derive(Debug, Default)]
pub(crate) struct DiagnosticControl {
    percentage: u32,
    counter: u64,
}

impl DiagnosticControl {
    pub(crate) fn set_percentage(&mut self, percentage: u32) {
        self.percentage = percentage;
        self.counter = 0;
    }

    /// Counts the message and, when sampled, injects the diagnostic id
    /// and creation-time application properties.
    pub(crate) fn annotate(&mut self, message: &mut Message) {
        if !self.sample() {
            return;
        }

        let id = Uuid::new_v4().simple().to_string();
        message
            .properties_mut()
            .add_or_update(DIAGNOSTIC_ID_PROPERTY, &id[..8]);
        message.properties_mut().add_or_update(
            DIAGNOSTIC_CREATION_TIME_PROPERTY,
            chrono::Utc::now().timestamp().to_string(),
        );
    }

    fn sample(&mut self) -> bool {
        if self.percentage == 0 {
            return false;
        }
        self.counter = self.counter.wrapping_add(1);
        if self.percentage >= 100 {
            return true;
        }
        // Position within the current century of messages, 1-based.
        let n = (self.counter - 1) % 100 + 1;
        let p = u64::from(self.percentage);
        (n * p) / 100 != ((n - 1) * p) / 100
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sampled_out_of_100(percentage: u32) -> usize {
        let mut control = DiagnosticControl::default();
        control.set_percentage(percentage);
        (0..100).filter(|_| control.sample()).count()
    }

    #[test]
    fn zero_percentage_never_samples() {
        assert_eq!(0, sampled_out_of_100(0));
    }

    #[test]
    fn full_percentage_always_samples() {
        assert_eq!(100, sampled_out_of_100(100));
    }

    #[test]
    fn percentage_selects_that_many_per_hundred() {
        for percentage in [1, 10, 33, 50, 99] {
            assert_eq!(
                percentage as usize,
                sampled_out_of_100(percentage),
                "percentage {percentage}"
            );
        }
    }

    #[test]
    fn annotation_adds_both_properties() {
        let mut control = DiagnosticControl::default();
        control.set_percentage(100);
        let mut message = Message::from_text("t");
        control.annotate(&mut message);
        assert!(message.properties().get(DIAGNOSTIC_ID_PROPERTY).is_some());
        assert!(message
            .properties()
            .get(DIAGNOSTIC_CREATION_TIME_PROPERTY)
            .is_some());
    }
}
