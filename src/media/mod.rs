// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Media graph discovery and configuration.
//!
//! A camera on a MIPI CSI-2 bus is exposed by the kernel as a chain of media
//! entities: the sensor, an optional image signal processor, the CSI-2
//! receiver and the capture unit that owns the `/dev/video*` node. Before the
//! capture node can stream, the links between those entities must be enabled
//! and every pad along the chain must agree on format and resolution.
//!
//! [`MediaGraph::discover`] finds the entities by name in the live topology,
//! and [`MediaGraph::configure`] resets all links, enables the links of the
//! pipeline and propagates pad formats, in that order.
//!
//! # Example
//!
//! ```no_run
//! use camera_capture::{
//!     format::BusFormatTable,
//!     media::{EntityConfig, EntityRole, MediaDevice, MediaGraph, PadConfig, SubstringMatcher},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let media = MediaDevice::open("/dev/media0")?;
//! let mut graph = MediaGraph::discover(media, &SubstringMatcher::default(), BusFormatTable::default());
//! graph.report().require_complete()?;
//!
//! graph.configure(&[EntityConfig {
//!     role: EntityRole::BusReceiver,
//!     sink_pad: PadConfig::sink(0, "YUYV", 1920, 1080),
//!     source_pad: PadConfig::source(1, "YUYV", 1920, 1080),
//! }])?;
//! # Ok(())
//! # }
//! ```

mod device;

pub use device::MediaDevice;

use serde::{Deserialize, Deserializer};
use std::{collections::BTreeMap, fmt, path::PathBuf};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    format::{BusFormat, BusFormatTable},
};

/// Role of an entity in the capture pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRole {
    Sensor,
    ImageSignalProcessor,
    BusReceiver,
    CaptureSink,
}

/// Roles in pipeline order, from the sensor to the capture node.
pub const PIPELINE_ORDER: [EntityRole; 4] = [
    EntityRole::Sensor,
    EntityRole::ImageSignalProcessor,
    EntityRole::BusReceiver,
    EntityRole::CaptureSink,
];

impl fmt::Display for EntityRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            EntityRole::Sensor => "sensor",
            EntityRole::ImageSignalProcessor => "ISP",
            EntityRole::BusReceiver => "bus receiver",
            EntityRole::CaptureSink => "capture sink",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PadKind {
    #[default]
    None,
    Source,
    Sink,
}

/// Format of one entity pad.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PadConfig {
    pub kind: PadKind,
    pub index: u32,
    /// Pixel-format tag, resolved through the [`BusFormatTable`]
    pub format: String,
    pub width: u32,
    pub height: u32,
}

impl PadConfig {
    pub fn source(index: u32, format: &str, width: u32, height: u32) -> Self {
        Self {
            kind: PadKind::Source,
            index,
            format: format.to_string(),
            width,
            height,
        }
    }

    pub fn sink(index: u32, format: &str, width: u32, height: u32) -> Self {
        Self {
            kind: PadKind::Sink,
            index,
            format: format.to_string(),
            width,
            height,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.kind != PadKind::None
    }
}

/// Pad formats requested for the entity filling `role`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityConfig {
    pub role: EntityRole,
    pub source_pad: PadConfig,
    pub sink_pad: PadConfig,
}

impl EntityConfig {
    pub fn new(role: EntityRole) -> Self {
        Self {
            role,
            source_pad: PadConfig::default(),
            sink_pad: PadConfig::default(),
        }
    }
}

/// An entity of the live topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityInfo {
    pub id: u32,
    pub name: String,
    /// Device node, when the entity has one (`/dev/video*`, `/dev/v4l-subdev*`)
    pub devnode: Option<PathBuf>,
}

/// A discovered pipeline entity with its bound configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineEntity {
    pub role: EntityRole,
    pub name: String,
    pub config: EntityConfig,
}

/// Request to enable the link from `source`:`source_pad` to `sink`:`sink_pad`.
///
/// Displays in media-ctl link syntax: `'src':0 -> 'sink':0 [1]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkRequest {
    pub source: String,
    pub source_pad: u32,
    pub sink: String,
    pub sink_pad: u32,
}

impl fmt::Display for LinkRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "'{}':{} -> '{}':{} [1]",
            self.source, self.source_pad, self.sink, self.sink_pad
        )
    }
}

/// Request to set the active format of a subdevice pad.
///
/// Displays in media-ctl format syntax:
/// `'entity':0 [fmt:YUYV8_1X16/1920x1080 field:none]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PadFormatRequest {
    pub entity: String,
    pub pad: u32,
    pub format: BusFormat,
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for PadFormatRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "'{}':{} [fmt:{}/{}x{} field:none]",
            self.entity, self.pad, self.format.name, self.width, self.height
        )
    }
}

/// Kernel media topology interface.
pub trait MediaController {
    /// All entities of the topology, in enumeration order.
    fn entities(&self) -> &[EntityInfo];

    /// Disables every mutable link.
    fn reset_links(&mut self) -> Result<()>;

    fn setup_link(&mut self, link: &LinkRequest) -> Result<()>;

    fn set_pad_format(&mut self, format: &PadFormatRequest) -> Result<()>;
}

/// Name resolution strategy for pipeline roles.
pub trait EntityMatcher {
    fn matches(&self, role: EntityRole, name: &str) -> bool;
}

/// Role to entity-name pattern table.
///
/// Deserialized patterns replace the [defaults](Self::default) of their
/// roles only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityPatterns(BTreeMap<EntityRole, String>);

impl EntityPatterns {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, role: EntityRole, pattern: &str) -> Self {
        self.0.insert(role, pattern.to_string());
        self
    }

    pub fn get(&self, role: EntityRole) -> Option<&str> {
        self.0.get(&role).map(String::as_str)
    }
}

impl Default for EntityPatterns {
    fn default() -> Self {
        Self::new()
            .with(EntityRole::Sensor, "ar1335")
            .with(EntityRole::ImageSignalProcessor, "ap1302")
            .with(EntityRole::BusReceiver, "csi2")
            .with(EntityRole::CaptureSink, "CRU")
    }
}

impl<'de> Deserialize<'de> for EntityPatterns {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let entries = BTreeMap::<EntityRole, String>::deserialize(deserializer)?;
        let mut patterns = Self::default();
        patterns.0.extend(entries);
        Ok(patterns)
    }
}

/// Matches a role when the entity name contains the role's pattern.
#[derive(Clone, Debug, Default)]
pub struct SubstringMatcher {
    patterns: EntityPatterns,
}

impl SubstringMatcher {
    pub fn new(patterns: EntityPatterns) -> Self {
        Self { patterns }
    }
}

impl EntityMatcher for SubstringMatcher {
    fn matches(&self, role: EntityRole, name: &str) -> bool {
        match self.patterns.get(role) {
            Some(pattern) => name.contains(pattern),
            None => false,
        }
    }
}

/// Outcome of [`MediaGraph::discover`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub found: Vec<EntityRole>,
    pub missing: Vec<EntityRole>,
}

impl DiscoveryReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Fails with [`Error::MissingEntity`] naming the first missing role.
    pub fn require_complete(&self) -> Result<()> {
        match self.missing.first() {
            Some(role) => Err(Error::MissingEntity(*role)),
            None => Ok(()),
        }
    }
}

/// What [`MediaGraph::configure`] applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigureReport {
    pub links: Vec<LinkRequest>,
    pub formats: Vec<PadFormatRequest>,
    /// Pad formats not pushed because the entity has no subdevice node
    pub skipped: Vec<PadFormatRequest>,
    /// Plan entries whose role is not part of the discovered pipeline
    pub unbound: Vec<EntityRole>,
}

/// The discovered capture pipeline on top of a media controller.
pub struct MediaGraph<C: MediaController> {
    controller: C,
    entities: Vec<PipelineEntity>,
    formats: BusFormatTable,
}

impl<C: MediaController> MediaGraph<C> {
    /// Finds, for each role in [`PIPELINE_ORDER`], the first entity whose
    /// name satisfies `matcher`. Roles without a match are left out of the
    /// pipeline and listed by [`report`](Self::report).
    pub fn discover(controller: C, matcher: &dyn EntityMatcher, formats: BusFormatTable) -> Self {
        let mut entities = Vec::new();
        for role in PIPELINE_ORDER {
            let found = controller
                .entities()
                .iter()
                .find(|entity| matcher.matches(role, &entity.name));
            match found {
                Some(entity) => {
                    debug!("{} entity: {}", role, entity.name);
                    entities.push(PipelineEntity {
                        role,
                        name: entity.name.clone(),
                        config: EntityConfig::new(role),
                    });
                }
                None => warn!("no {} entity found in media graph", role),
            }
        }

        Self {
            controller,
            entities,
            formats,
        }
    }

    /// Discovered pipeline, in pipeline order.
    pub fn entities(&self) -> &[PipelineEntity] {
        &self.entities
    }

    pub fn entity(&self, role: EntityRole) -> Option<&PipelineEntity> {
        self.entities.iter().find(|entity| entity.role == role)
    }

    pub fn report(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        for role in PIPELINE_ORDER {
            if self.entity(role).is_some() {
                report.found.push(role);
            } else {
                report.missing.push(role);
            }
        }
        report
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Device node of the first video capture entity in the topology.
    pub fn capture_device_path(&self) -> Option<PathBuf> {
        capture_node(self.controller.entities())
    }

    /// Applies `plan` to the discovered pipeline.
    ///
    /// All links are reset first, so applying the same plan twice leaves the
    /// graph in the same state as applying it once. For each entity, the link
    /// to the next entity is enabled before its own pad formats are set.
    /// Pad formats only apply to subdevices; pads of an entity without a
    /// `/dev/v4l-subdev*` node (a video node matched as capture sink) are
    /// listed in [`ConfigureReport::skipped`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the link endpoints disagree on format or
    /// resolution, or a pad uses a format tag missing from the bus-format
    /// table, and the controller's error when a link or format is rejected.
    pub fn configure(&mut self, plan: &[EntityConfig]) -> Result<ConfigureReport> {
        let mut report = ConfigureReport::default();

        self.controller.reset_links()?;

        for entity in self.entities.iter_mut() {
            entity.config = EntityConfig::new(entity.role);
        }
        for config in plan {
            match self.entities.iter_mut().find(|e| e.role == config.role) {
                Some(entity) => entity.config = config.clone(),
                None => {
                    warn!("{} is not in the media graph, skipping its pads", config.role);
                    report.unbound.push(config.role);
                }
            }
        }

        for i in 0..self.entities.len() {
            if let Some(next) = self.entities.get(i + 1) {
                if let Some(link) = link_request(&self.entities[i], next)? {
                    info!("link {}", link);
                    self.controller.setup_link(&link)?;
                    report.links.push(link);
                }
            }

            let entity = &self.entities[i];
            let subdev = has_subdev(self.controller.entities(), &entity.name);
            for pad in [&entity.config.sink_pad, &entity.config.source_pad] {
                if let Some(format) = self.pad_format_request(&entity.name, pad)? {
                    if !subdev {
                        warn!("'{}' has no subdevice node, skipping format {}", entity.name, format);
                        report.skipped.push(format);
                        continue;
                    }
                    info!("format {}", format);
                    self.controller.set_pad_format(&format)?;
                    report.formats.push(format);
                }
            }
        }

        Ok(report)
    }

    fn pad_format_request(&self, entity: &str, pad: &PadConfig) -> Result<Option<PadFormatRequest>> {
        if entity.is_empty() || !pad.is_configured() {
            return Ok(None);
        }
        let format = self.formats.get(&pad.format).ok_or_else(|| {
            Error::Config(format!("unknown bus format {:?} for '{}'", pad.format, entity))
        })?;
        Ok(Some(PadFormatRequest {
            entity: entity.to_string(),
            pad: pad.index,
            format: format.clone(),
            width: pad.width,
            height: pad.height,
        }))
    }
}

/// Device node of the first entity exposing a `/dev/video*` node.
pub fn capture_node(entities: &[EntityInfo]) -> Option<PathBuf> {
    entities
        .iter()
        .filter_map(|entity| entity.devnode.as_ref())
        .find(|devnode| devnode.to_string_lossy().contains("/dev/video"))
        .cloned()
}

/// Whether the entity named `name` exposes a `/dev/v4l-subdev*` node.
fn has_subdev(entities: &[EntityInfo], name: &str) -> bool {
    entities
        .iter()
        .find(|entity| entity.name == name)
        .and_then(|entity| entity.devnode.as_ref())
        .is_some_and(|devnode| devnode.to_string_lossy().contains("/dev/v4l-subdev"))
}

/// Link from `source`'s source pad to `sink`'s sink pad, or `None` when
/// either end is unconfigured or unnamed.
fn link_request(source: &PipelineEntity, sink: &PipelineEntity) -> Result<Option<LinkRequest>> {
    let src_pad = &source.config.source_pad;
    let sink_pad = &sink.config.sink_pad;

    if source.name.is_empty() || sink.name.is_empty() {
        return Ok(None);
    }
    if !src_pad.is_configured() || !sink_pad.is_configured() {
        return Ok(None);
    }
    if src_pad.format != sink_pad.format
        || src_pad.width != sink_pad.width
        || src_pad.height != sink_pad.height
    {
        return Err(Error::Config(format!(
            "'{}':{} {} {}x{} does not match '{}':{} {} {}x{}",
            source.name,
            src_pad.index,
            src_pad.format,
            src_pad.width,
            src_pad.height,
            sink.name,
            sink_pad.index,
            sink_pad.format,
            sink_pad.width,
            sink_pad.height,
        )));
    }

    Ok(Some(LinkRequest {
        source: source.name.clone(),
        source_pad: src_pad.index,
        sink: sink.name.clone(),
        sink_pad: sink_pad.index,
    }))
}
