// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{
    fs::{self, File, OpenOptions},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use super::{EntityInfo, LinkRequest, MediaController, PadFormatRequest};
use crate::{
    error::{Error, Result},
    sys::{self, MediaEntityDesc, MediaLinkDesc, MediaLinksEnum, MediaPadDesc, V4l2SubdevFormat},
};
use nix::errno::Errno;

#[derive(Debug)]
struct Entity {
    info: EntityInfo,
    pads: u16,
    links: u16,
}

/// Kernel media controller device (`/dev/mediaN`).
///
/// The topology is enumerated when the device is opened; opening fails if
/// the enumeration fails.
#[derive(Debug)]
pub struct MediaDevice {
    file: File,
    path: PathBuf,
    entities: Vec<Entity>,
    infos: Vec<EntityInfo>,
}

impl MediaDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::device("media device open", e))?;

        let mut dev = Self {
            file,
            path,
            entities: Vec::new(),
            infos: Vec::new(),
        };
        dev.enumerate()?;
        debug!("{} has {} entities", dev.path.display(), dev.entities.len());
        Ok(dev)
    }

    /// Opens `/dev/media<index>`.
    pub fn open_index(index: u32) -> Result<Self> {
        Self::open(format!("/dev/media{}", index))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn enumerate(&mut self) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let mut id = 0;
        loop {
            let mut desc: MediaEntityDesc = unsafe { std::mem::zeroed() };
            desc.id = id | sys::MEDIA_ENT_ID_FLAG_NEXT;
            match sys::retry(|| unsafe { sys::media_ioc_enum_entities(fd, &mut desc) }) {
                Ok(_) => {}
                Err(Errno::EINVAL) => break,
                Err(e) => return Err(Error::device("MEDIA_IOC_ENUM_ENTITIES", e)),
            }
            id = desc.id;

            let info = EntityInfo {
                id: desc.id,
                name: sys::c_str(&desc.name),
                devnode: devnode(desc.dev_major, desc.dev_minor),
            };
            self.infos.push(info.clone());
            self.entities.push(Entity {
                info,
                pads: desc.pads,
                links: desc.links,
            });
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Result<&Entity> {
        self.entities
            .iter()
            .find(|entity| entity.info.name == name)
            .ok_or_else(|| Error::Config(format!("no entity named '{}'", name)))
    }

    fn links(&self, entity: &Entity) -> Result<Vec<MediaLinkDesc>> {
        let mut pads = vec![MediaPadDesc::default(); entity.pads as usize];
        let mut links = vec![MediaLinkDesc::default(); entity.links as usize];
        let mut req = MediaLinksEnum {
            entity: entity.info.id,
            pads: pads.as_mut_ptr(),
            links: links.as_mut_ptr(),
            reserved: [0; 4],
        };
        let fd = self.file.as_raw_fd();
        sys::retry(|| unsafe { sys::media_ioc_enum_links(fd, &mut req) })
            .map_err(|e| Error::device("MEDIA_IOC_ENUM_LINKS", e))?;
        Ok(links)
    }

    fn setup(&self, link: &mut MediaLinkDesc) -> Result<()> {
        let fd = self.file.as_raw_fd();
        sys::retry(|| unsafe { sys::media_ioc_setup_link(fd, &mut *link) })
            .map_err(|e| Error::device("MEDIA_IOC_SETUP_LINK", e))?;
        Ok(())
    }
}

impl MediaController for MediaDevice {
    fn entities(&self) -> &[EntityInfo] {
        &self.infos
    }

    fn reset_links(&mut self) -> Result<()> {
        for entity in &self.entities {
            if entity.links == 0 {
                continue;
            }
            for mut link in self.links(entity)? {
                if link.source.entity != entity.info.id
                    || link.flags & sys::MEDIA_LNK_FL_IMMUTABLE != 0
                    || link.flags & sys::MEDIA_LNK_FL_ENABLED == 0
                {
                    continue;
                }
                link.flags &= !sys::MEDIA_LNK_FL_ENABLED;
                self.setup(&mut link)?;
            }
        }
        Ok(())
    }

    fn setup_link(&mut self, link: &LinkRequest) -> Result<()> {
        let mut desc = MediaLinkDesc {
            source: MediaPadDesc {
                entity: self.find(&link.source)?.info.id,
                index: link.source_pad as u16,
                flags: sys::MEDIA_PAD_FL_SOURCE,
                ..Default::default()
            },
            sink: MediaPadDesc {
                entity: self.find(&link.sink)?.info.id,
                index: link.sink_pad as u16,
                flags: sys::MEDIA_PAD_FL_SINK,
                ..Default::default()
            },
            flags: sys::MEDIA_LNK_FL_ENABLED,
            reserved: [0; 2],
        };
        self.setup(&mut desc)
    }

    fn set_pad_format(&mut self, format: &PadFormatRequest) -> Result<()> {
        let entity = self.find(&format.entity)?;
        let devnode = entity.info.devnode.as_ref().ok_or_else(|| {
            Error::Config(format!("'{}' has no subdevice node", format.entity))
        })?;
        let subdev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(devnode)
            .map_err(|e| Error::device("subdevice open", e))?;

        let mut fmt = V4l2SubdevFormat {
            which: sys::V4L2_SUBDEV_FORMAT_ACTIVE,
            pad: format.pad,
            ..Default::default()
        };
        fmt.format.width = format.width;
        fmt.format.height = format.height;
        fmt.format.code = format.format.code;
        fmt.format.field = sys::V4L2_FIELD_NONE;

        let fd = subdev.as_raw_fd();
        sys::retry(|| unsafe { sys::vidioc_subdev_s_fmt(fd, &mut fmt) })
            .map_err(|e| Error::device("VIDIOC_SUBDEV_S_FMT", e))?;

        if fmt.format.width != format.width
            || fmt.format.height != format.height
            || fmt.format.code != format.format.code
        {
            warn!(
                "'{}':{} adjusted to {:#x}/{}x{}",
                format.entity, format.pad, fmt.format.code, fmt.format.width, fmt.format.height
            );
        }
        Ok(())
    }
}

/// Resolves a character device number to its `/dev` node through sysfs.
fn devnode(major: u32, minor: u32) -> Option<PathBuf> {
    if major == 0 && minor == 0 {
        return None;
    }
    let uevent = fs::read_to_string(format!("/sys/dev/char/{}:{}/uevent", major, minor)).ok()?;
    uevent
        .lines()
        .find_map(|line| line.strip_prefix("DEVNAME="))
        .map(|name| Path::new("/dev").join(name))
}
