//! Streaming enumeration of twin documents and desired patches.

use anyhow::Context;
use serde_json::Value;

use crate::error::ClientError;
use crate::transport::TwinUpdateKind;

use super::{Property, PropertyOrigin, PropertyValue};

const VERSION_KEY: &str = "$version";
const COMPONENT_MARKER_KEY: &str = "__t";

/// Lazily enumerates the properties of a twin payload.
///
/// Enumeration order is stable for equivalent inputs: root-level desired
/// properties first, then root-level reported properties, then for every
/// declared component (in the order supplied) its desired members
/// followed by its reported members. A top-level member is treated as a
/// component exactly when its name appears in the supplied component
/// list; the wire marker `"__t":"c"` is not required on receipt and is
/// never taken as authoritative. The reserved keys `$version` and `__t`
/// never surface.
pub struct PropertyIterator {
    version: i64,
    root_desired: Vec<(String, Value)>,
    root_reported: Vec<(String, Value)>,
    components: Vec<ComponentEntries>,
    stage: Stage,
    cursor: usize,
}

struct ComponentEntries {
    name: String,
    desired: Vec<(String, Value)>,
    reported: Vec<(String, Value)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    RootDesired,
    RootReported,
    Component { index: usize, reported: bool },
    Done,
}

impl PropertyIterator {
    /// Parses `payload` and prepares enumeration.
    ///
    /// For [`TwinUpdateKind::Complete`] the payload is the full
    /// `{"desired":…,"reported":…}` envelope; either half may be absent.
    /// For [`TwinUpdateKind::Partial`] the root object itself is the
    /// desired fragment. In both cases the desired `$version` must be
    /// present and numeric.
    pub fn new(
        kind: TwinUpdateKind,
        payload: &[u8],
        components: &[&str],
    ) -> Result<Self, ClientError> {
        if payload.is_empty() {
            return Err(ClientError::InvalidArg("twin payload is empty"));
        }
        if components.iter().any(|component| component.is_empty()) {
            return Err(ClientError::InvalidArg("component name is empty"));
        }

        let root: Value =
            serde_json::from_slice(payload).context("Unable to parse the twin payload as JSON")?;
        let Value::Object(mut root) = root else {
            return Err(ClientError::failed("the twin payload is not a JSON object"));
        };

        let (desired, reported) = match kind {
            TwinUpdateKind::Complete => {
                let desired = match root.remove("desired") {
                    Some(Value::Object(map)) => map,
                    Some(_) => {
                        return Err(ClientError::failed("the desired section is not an object"))
                    }
                    None => serde_json::Map::new(),
                };
                let reported = match root.remove("reported") {
                    Some(Value::Object(map)) => map,
                    Some(_) => {
                        return Err(ClientError::failed("the reported section is not an object"))
                    }
                    None => serde_json::Map::new(),
                };
                (desired, reported)
            }
            TwinUpdateKind::Partial => (root, serde_json::Map::new()),
        };

        let version = desired
            .get(VERSION_KEY)
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                ClientError::failed("the desired properties carry no numeric $version")
            })?;

        let mut iterator = PropertyIterator {
            version,
            root_desired: Vec::new(),
            root_reported: Vec::new(),
            components: components
                .iter()
                .map(|name| ComponentEntries {
                    name: (*name).to_owned(),
                    desired: Vec::new(),
                    reported: Vec::new(),
                })
                .collect(),
            stage: Stage::RootDesired,
            cursor: 0,
        };

        PropertyIterator::partition(&mut iterator, desired, false);
        PropertyIterator::partition(&mut iterator, reported, true);

        Ok(iterator)
    }

    /// The `$version` of the desired half.
    pub fn version(&self) -> i64 {
        self.version
    }

    fn partition(&mut self, section: serde_json::Map<String, Value>, reported: bool) {
        for (name, value) in section {
            if name == VERSION_KEY {
                continue;
            }
            if let Some(component) = self
                .components
                .iter_mut()
                .find(|component| component.name == name)
            {
                let Value::Object(members) = value else {
                    log::debug!("Component '{name}' is not an object; skipping");
                    continue;
                };
                let target = if reported {
                    &mut component.reported
                } else {
                    &mut component.desired
                };
                for (member_name, member_value) in members {
                    if member_name == COMPONENT_MARKER_KEY {
                        continue;
                    }
                    target.push((member_name, member_value));
                }
            } else if reported {
                self.root_reported.push((name, value));
            } else {
                self.root_desired.push((name, value));
            }
        }
    }

    fn current_bucket(&self) -> (&[(String, Value)], PropertyOrigin, Option<&str>) {
        match self.stage {
            Stage::RootDesired => (&self.root_desired, PropertyOrigin::Writable, None),
            Stage::RootReported => (&self.root_reported, PropertyOrigin::ReportedFromClient, None),
            Stage::Component { index, reported } => {
                let component = &self.components[index];
                if reported {
                    (
                        &component.reported,
                        PropertyOrigin::ReportedFromClient,
                        Some(component.name.as_str()),
                    )
                } else {
                    (
                        &component.desired,
                        PropertyOrigin::Writable,
                        Some(component.name.as_str()),
                    )
                }
            }
            Stage::Done => (&[], PropertyOrigin::Writable, None),
        }
    }

    fn advance_stage(&mut self) {
        self.cursor = 0;
        self.stage = match self.stage {
            Stage::RootDesired => Stage::RootReported,
            Stage::RootReported if !self.components.is_empty() => Stage::Component {
                index: 0,
                reported: false,
            },
            Stage::RootReported => Stage::Done,
            Stage::Component {
                index,
                reported: false,
            } => Stage::Component {
                index,
                reported: true,
            },
            Stage::Component {
                index,
                reported: true,
            } if index + 1 < self.components.len() => Stage::Component {
                index: index + 1,
                reported: false,
            },
            Stage::Component { .. } | Stage::Done => Stage::Done,
        };
    }
}

impl Iterator for PropertyIterator {
    type Item = Property;

    fn next(&mut self) -> Option<Property> {
        loop {
            if self.stage == Stage::Done {
                return None;
            }

            let (bucket, origin, component) = self.current_bucket();
            if self.cursor < bucket.len() {
                let (name, value) = &bucket[self.cursor];
                let property = Property {
                    origin,
                    component: component.map(str::to_owned),
                    name: name.clone(),
                    value: PropertyValue::Json(
                        serde_json::to_string(value)
                            .expect("serializing a parsed JSON value cannot fail"),
                    ),
                };
                self.cursor += 1;
                return Some(property);
            }

            self.advance_stage();
        }
    }
}
