// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Pixel and media-bus format descriptions.

use serde::{Deserialize, Deserializer};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Four character code identifying a V4L2 pixel format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

/// YUYV 4:2:2 YUV packed format (the capture format)
pub const YUYV: FourCC = FourCC(*b"YUYV");

/// UYVY 4:2:2 YUV packed format
pub const UYVY: FourCC = FourCC(*b"UYVY");

/// NV12 4:2:0 YUV semi-planar format
pub const NV12: FourCC = FourCC(*b"NV12");

/// RGB 24-bit pixel format
pub const RGB3: FourCC = FourCC(*b"RGB3");

/// RGBA 32-bit pixel format
pub const RGBA: FourCC = FourCC(*b"RGBA");

impl FourCC {
    /// Bytes needed for one row of `width` pixels, or `None` for formats the
    /// pipeline does not know how to size.
    pub const fn row_stride(self, width: u32) -> Option<usize> {
        match self {
            YUYV | UYVY => Some(2 * width as usize),
            RGB3 => Some(3 * width as usize),
            RGBA => Some(4 * width as usize),
            NV12 => Some(width as usize),
            _ => None,
        }
    }

    /// Bytes needed for a full `width` x `height` image.
    pub const fn image_size(self, width: u32, height: u32) -> Option<usize> {
        match self.row_stride(width) {
            Some(stride) => match self {
                NV12 => Some(stride * height as usize * 3 / 2),
                _ => Some(stride * height as usize),
            },
            None => None,
        }
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> Self {
        u32::from_le_bytes(fourcc.0)
    }
}

impl From<u32> for FourCC {
    fn from(value: u32) -> Self {
        FourCC(value.to_le_bytes())
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

impl FromStr for FourCC {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| format!("fourcc must be 4 characters, got {:?}", s))?;
        Ok(FourCC(bytes))
    }
}

impl<'de> Deserialize<'de> for FourCC {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A media-bus format: the name used in pad format strings and the kernel
/// `MEDIA_BUS_FMT_*` code.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BusFormat {
    pub name: String,
    pub code: u32,
}

/// Lookup table from pixel-format tags (as used in pad configurations) to
/// media-bus formats.
///
/// Deserialized entries are added to the [default](Self::default) table,
/// replacing defaults with the same tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusFormatTable(BTreeMap<String, BusFormat>);

impl BusFormatTable {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, tag: &str, name: &str, code: u32) {
        self.0.insert(
            tag.to_string(),
            BusFormat {
                name: name.to_string(),
                code,
            },
        );
    }

    pub fn get(&self, tag: &str) -> Option<&BusFormat> {
        self.0.get(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for BusFormatTable {
    fn default() -> Self {
        let mut table = Self::new();
        table.insert("FIXED", "FIXED", 0x0001);
        table.insert("YUYV", "YUYV8_1X16", 0x2011);
        table.insert("UYVY", "UYVY8_1X16", 0x200f);
        table.insert("SBGGR8", "SBGGR8_1X8", 0x3001);
        table.insert("SGBRG8", "SGBRG8_1X8", 0x3013);
        table.insert("SGRBG8", "SGRBG8_1X8", 0x3002);
        table.insert("SRGGB8", "SRGGB8_1X8", 0x3014);
        table.insert("SBGGR10", "SBGGR10_1X10", 0x3007);
        table.insert("SGBRG10", "SGBRG10_1X10", 0x300e);
        table.insert("SGRBG10", "SGRBG10_1X10", 0x300a);
        table.insert("SRGGB10", "SRGGB10_1X10", 0x300f);
        table.insert("SBGGR12", "SBGGR12_1X12", 0x3008);
        table.insert("SGBRG12", "SGBRG12_1X12", 0x3010);
        table.insert("SGRBG12", "SGRBG12_1X12", 0x3011);
        table.insert("SRGGB12", "SRGGB12_1X12", 0x3012);
        table.insert("RBG24", "RBG888_1X24", 0x100e);
        table.insert("RGB32", "RGB888_1X32_PADHI", 0x100f);
        table.insert("ARGB32", "ARGB8888_1X32", 0x100d);
        table
    }
}

impl<'de> Deserialize<'de> for BusFormatTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::<String, BusFormat>::deserialize(deserializer)?;
        let mut table = Self::default();
        table.0.extend(entries);
        Ok(table)
    }
}
