//! MMC response decoding: GET CONFIGURATION profile and READ TOC format 0.

use serde::Serialize;

use crate::core::DecodeError;

/// GET CONFIGURATION profile numbers (MMC-6 table 87).
pub mod profile {
    pub const NONE: u16 = 0x0000;
    pub const CD_ROM: u16 = 0x0008;
    pub const CD_R: u16 = 0x0009;
    pub const CD_RW: u16 = 0x000A;
    pub const DVD_ROM: u16 = 0x0010;
    pub const DVD_R: u16 = 0x0011;
    pub const DVD_RAM: u16 = 0x0012;
    pub const DVD_RW_RO: u16 = 0x0013;
    pub const DVD_RW_SEQ: u16 = 0x0014;
    pub const DVD_R_DL: u16 = 0x0015;
    pub const DVD_R_DL_JUMP: u16 = 0x0016;
    pub const DVD_PLUS_RW: u16 = 0x001A;
    pub const DVD_PLUS_R: u16 = 0x001B;
    pub const DVD_PLUS_RW_DL: u16 = 0x002A;
    pub const DVD_PLUS_R_DL: u16 = 0x002B;
    pub const BD_ROM: u16 = 0x0040;
    pub const BD_R_SRM: u16 = 0x0041;
    pub const BD_R_RRM: u16 = 0x0042;
    pub const BD_RE: u16 = 0x0043;
    pub const HD_DVD_ROM: u16 = 0x0050;
    pub const HD_DVD_R: u16 = 0x0051;
    pub const HD_DVD_RAM: u16 = 0x0052;
}

const CONFIGURATION_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaKind {
    Cd,
    Dvd,
    HdDvd,
    BluRay,
}

/// Maps a current-profile number to the disc family it denotes, or `None`
/// for "no disc" and profiles that are not optical discs.
pub fn media_kind(current_profile: u16) -> Option<MediaKind> {
    use profile::*;
    match current_profile {
        CD_ROM..=CD_RW => Some(MediaKind::Cd),
        DVD_ROM..=DVD_R_DL_JUMP | DVD_PLUS_RW | DVD_PLUS_R | DVD_PLUS_RW_DL | DVD_PLUS_R_DL => {
            Some(MediaKind::Dvd)
        }
        BD_ROM..=BD_RE => Some(MediaKind::BluRay),
        HD_DVD_ROM..=HD_DVD_RAM => Some(MediaKind::HdDvd),
        _ => None,
    }
}

/// Current profile from a GET CONFIGURATION response (header bytes 6-7).
pub fn current_profile(response: &[u8]) -> Result<u16, DecodeError> {
    if response.len() < CONFIGURATION_HEADER_LEN {
        return Err(DecodeError::Truncated {
            what: "GET CONFIGURATION header",
            needed: CONFIGURATION_HEADER_LEN,
            actual: response.len(),
        });
    }
    Ok(u16::from_be_bytes([response[6], response[7]]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TocTrack {
    pub number: u8,
    pub adr: u8,
    pub control: u8,
    pub start_lba: u32,
}

impl TocTrack {
    /// Lead-out pseudo-track.
    pub const LEAD_OUT: u8 = 0xAA;

    #[inline]
    pub fn is_data(&self) -> bool {
        self.control & 0x04 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toc {
    pub first_track: u8,
    pub last_track: u8,
    pub tracks: Vec<TocTrack>,
}

const TOC_HEADER_LEN: usize = 4;
const TOC_DESCRIPTOR_LEN: usize = 8;

impl Toc {
    /// Parses a READ TOC format 0 response. A declared length beyond the
    /// buffer is clipped to the whole descriptors present.
    pub fn parse(response: &[u8]) -> Result<Self, DecodeError> {
        if response.len() < TOC_HEADER_LEN {
            return Err(DecodeError::Truncated {
                what: "TOC header",
                needed: TOC_HEADER_LEN,
                actual: response.len(),
            });
        }
        // Data length excludes its own two bytes.
        let declared = 2 + usize::from(u16::from_be_bytes([response[0], response[1]]));
        let end = declared.min(response.len());
        let body = response.get(TOC_HEADER_LEN..end).unwrap_or_default();

        let tracks: Vec<TocTrack> = body
            .chunks_exact(TOC_DESCRIPTOR_LEN)
            .map(|d| TocTrack {
                adr: d[1] >> 4,
                control: d[1] & 0x0F,
                number: d[2],
                start_lba: u32::from_be_bytes([d[4], d[5], d[6], d[7]]),
            })
            .collect();

        if tracks.is_empty() {
            return Err(DecodeError::Malformed {
                what: "TOC",
                reason: "no track descriptors".to_string(),
            });
        }

        Ok(Self {
            first_track: response[2],
            last_track: response[3],
            tracks,
        })
    }

    /// Tracks excluding the lead-out.
    pub fn user_tracks(&self) -> impl Iterator<Item = &TocTrack> {
        self.tracks.iter().filter(|t| t.number != TocTrack::LEAD_OUT)
    }

    pub fn has_tracks(&self) -> bool {
        self.user_tracks().next().is_some()
    }

    /// Encodes a format 0 response, for device emulation.
    pub fn to_response(&self) -> Vec<u8> {
        let len = 2 + self.tracks.len() * TOC_DESCRIPTOR_LEN;
        let mut out = Vec::with_capacity(2 + len);
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.push(self.first_track);
        out.push(self.last_track);
        for t in &self.tracks {
            out.extend_from_slice(&[0, t.adr << 4 | (t.control & 0x0F), t.number, 0]);
            out.extend_from_slice(&t.start_lba.to_be_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_track_toc() -> Toc {
        Toc {
            first_track: 1,
            last_track: 1,
            tracks: vec![
                TocTrack {
                    number: 1,
                    adr: 1,
                    control: 4,
                    start_lba: 0,
                },
                TocTrack {
                    number: TocTrack::LEAD_OUT,
                    adr: 1,
                    control: 4,
                    start_lba: 1000,
                },
            ],
        }
    }

    #[test]
    fn test_toc_parse() {
        let toc = Toc::parse(&two_track_toc().to_response()).unwrap();
        assert_eq!(toc, two_track_toc());
        assert!(toc.has_tracks());
        assert!(toc.tracks[0].is_data());
    }

    #[test]
    fn test_toc_declared_length_clipped() {
        let mut resp = two_track_toc().to_response();
        resp.truncate(4 + 8 + 3);
        let toc = Toc::parse(&resp).unwrap();
        assert_eq!(toc.tracks.len(), 1);
    }

    #[test]
    fn test_toc_without_descriptors_is_malformed() {
        assert!(matches!(
            Toc::parse(&[0, 2, 1, 1]),
            Err(DecodeError::Malformed { .. })
        ));
        assert!(matches!(Toc::parse(&[0, 2]), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_profiles() {
        assert_eq!(media_kind(profile::CD_R), Some(MediaKind::Cd));
        assert_eq!(media_kind(profile::DVD_PLUS_R), Some(MediaKind::Dvd));
        assert_eq!(media_kind(profile::BD_RE), Some(MediaKind::BluRay));
        assert_eq!(media_kind(profile::NONE), None);
        assert_eq!(media_kind(0x0002), None);
    }

    #[test]
    fn test_current_profile() {
        let header = [0, 0, 0, 4, 0, 0, 0x00, 0x09];
        assert_eq!(current_profile(&header).unwrap(), profile::CD_R);
        assert!(current_profile(&header[..6]).is_err());
    }
}
