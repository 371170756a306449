//! Decode timestamp extraction for H264 and H265.
//!
//! Streams with B-frames present pictures out of decode order. The picture
//! order count of each slice tells how far ahead of its decode position a
//! picture is displayed, which, together with the frame duration learnt from
//! PTS values, gives the decode timestamp.

use bytes::Bytes;

use super::{h264, h265};
use crate::error::{HlsError, HlsResult};

const MAX_REORDERED_FRAMES: i64 = 10;

#[derive(Default)]
struct PocState {
    base_pts: i64,
    base_poc: u32,
    frames: u32,
    poc_increment: u32,
    reordered: i64,
    frame_duration: i64,
    prev_dts: Option<i64>,
}

impl PocState {
    fn new(poc_increment: u32) -> Self {
        Self {
            poc_increment,
            ..Default::default()
        }
    }

    fn reset(&mut self, pts: i64, poc: u32) -> i64 {
        self.base_pts = pts;
        self.base_poc = poc;
        self.frames = 0;
        self.reordered = 0;
        self.finish(pts, pts)
    }

    /// DTS never exceeds PTS unless that would stop it from strictly
    /// increasing.
    fn finish(&mut self, dts: i64, pts: i64) -> i64 {
        let mut dts = dts.min(pts);
        if let Some(prev) = self.prev_dts {
            dts = dts.max(prev + 1);
        }
        self.prev_dts = Some(dts);
        dts
    }

    fn extract(&mut self, poc: u32, pts: i64, log2_max_poc: u32) -> HlsResult<i64> {
        let max_poc = 1i64 << log2_max_poc;
        self.frames += 1;

        if self.poc_increment == 2 && poc % 2 != 0 {
            self.poc_increment = 1;
        }
        let increment = self.poc_increment as i64;

        let expected = (self.base_poc as i64 + self.frames as i64 * increment) & (max_poc - 1);
        let mut diff = (poc as i64 - expected) & (max_poc - 1);
        if diff > max_poc / 2 {
            diff -= max_poc;
        }
        let diff = diff / increment;

        let presentation_index = self.frames as i64 + diff;
        if presentation_index > 0 && pts > self.base_pts {
            self.frame_duration = (pts - self.base_pts) / presentation_index;
        }

        if diff < -self.reordered {
            self.reordered = -diff;
            if self.reordered > MAX_REORDERED_FRAMES {
                return Err(HlsError::codec(
                    "H26x",
                    format!("too many reordered frames ({})", self.reordered),
                ));
            }
        }

        // a picture displayed after its decode slot implies that at least
        // one following picture is reordered before it
        let reordered = if diff > 0 {
            self.reordered.max(1)
        } else {
            self.reordered
        };
        let dts = pts - (diff + reordered) * self.frame_duration;
        Ok(self.finish(dts, pts))
    }
}

enum Params {
    H264 {
        sps: Option<(Bytes, h264::Sps)>,
    },
    H265 {
        sps: Option<(Bytes, h265::Sps)>,
        pps: Option<(Bytes, h265::Pps)>,
    },
}

/// Computes DTS values from access units and their PTS, expressed in the same
/// clock.
pub struct DtsExtractor {
    params: Params,
    state: PocState,
}

impl DtsExtractor {
    pub fn new_h264() -> Self {
        Self {
            params: Params::H264 { sps: None },
            state: PocState::new(2),
        }
    }

    pub fn new_h265() -> Self {
        Self {
            params: Params::H265 {
                sps: None,
                pps: None,
            },
            state: PocState::new(1),
        }
    }

    pub fn extract(&mut self, au: &[Bytes], pts: i64) -> HlsResult<i64> {
        match &mut self.params {
            Params::H264 { sps } => {
                if let (Some(nalu), _) = h264::find_params(au) {
                    if sps.as_ref().map_or(true, |(prev, _)| prev != nalu) {
                        *sps = Some((nalu.clone(), h264::Sps::parse(nalu)?));
                        self.state = PocState {
                            prev_dts: self.state.prev_dts,
                            ..PocState::new(2)
                        };
                    }
                }
                let (_, sps) = sps
                    .as_ref()
                    .ok_or_else(|| HlsError::codec("H264", "SPS not received yet"))?;

                if sps.pic_order_cnt_type == 2 || !sps.frame_mbs_only {
                    return Ok(self.state.finish(pts, pts));
                }
                if sps.pic_order_cnt_type == 1 {
                    return Err(HlsError::codec(
                        "H264",
                        "pic_order_cnt_type = 1 is not supported yet",
                    ));
                }

                if h264::is_random_access(au) {
                    return Ok(self.state.reset(pts, 0));
                }

                let slice = au
                    .iter()
                    .find(|n| h264::nalu_type(n) == h264::NALU_TYPE_NON_IDR)
                    .ok_or_else(|| {
                        HlsError::codec("H264", "access unit without IDR or non-IDR NALU")
                    })?;
                let poc = h264::slice_poc_lsb(slice, sps)?;
                self.state.extract(poc, pts, sps.log2_max_pic_order_cnt_lsb)
            }
            Params::H265 { sps, pps } => {
                let (_, new_sps, new_pps) = h265::find_params(au);
                if let Some(nalu) = new_sps {
                    if sps.as_ref().map_or(true, |(prev, _)| prev != nalu) {
                        *sps = Some((nalu.clone(), h265::Sps::parse(nalu)?));
                        self.state = PocState {
                            prev_dts: self.state.prev_dts,
                            ..PocState::new(1)
                        };
                    }
                }
                if let Some(nalu) = new_pps {
                    if pps.as_ref().map_or(true, |(prev, _)| prev != nalu) {
                        *pps = Some((nalu.clone(), h265::Pps::parse(nalu)?));
                    }
                }
                let ((_, sps), (_, pps)) = sps.as_ref().zip(pps.as_ref()).ok_or_else(|| {
                    HlsError::codec("H265", "SPS or PPS not received yet")
                })?;

                let slice = h265::first_slice(au)
                    .ok_or_else(|| HlsError::codec("H265", "access unit doesn't contain a slice"))?;
                let poc = h265::slice_poc_lsb(slice, sps, pps)?;

                if h265::is_random_access(au) {
                    return Ok(self.state.reset(pts, poc));
                }
                self.state.extract(poc, pts, sps.log2_max_pic_order_cnt_lsb)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::h264::tests::{PPS, SPS};

    struct BitWriter {
        bits: Vec<bool>,
    }

    impl BitWriter {
        fn bits(&mut self, v: u32, n: u32) {
            for i in (0..n).rev() {
                self.bits.push((v >> i) & 1 == 1);
            }
        }

        fn ue(&mut self, v: u32) {
            let v = v + 1;
            let len = 32 - v.leading_zeros();
            self.bits(0, len - 1);
            self.bits(v, len);
        }

        fn finish(mut self) -> Vec<u8> {
            self.bits.push(true);
            while self.bits.len() % 8 != 0 {
                self.bits.push(false);
            }
            self.bits
                .chunks(8)
                .map(|c| c.iter().fold(0u8, |acc, b| (acc << 1) | *b as u8))
                .collect()
        }
    }

    /// A non-IDR slice with the given picture order count. The test SPS uses
    /// 4 bits of frame_num and 6 bits of POC.
    fn slice(slice_type: u32, poc: u32) -> Bytes {
        let mut w = BitWriter { bits: Vec::new() };
        w.ue(0);
        w.ue(slice_type);
        w.ue(0);
        w.bits(0, 4);
        w.bits(poc, 6);
        let mut nalu = vec![0x41];
        nalu.extend(w.finish());
        Bytes::from(nalu)
    }

    #[test]
    fn test_h264_b_frames() -> HlsResult<()> {
        let mut extractor = DtsExtractor::new_h264();
        let idr = vec![
            Bytes::from_static(&SPS),
            Bytes::from_static(&PPS),
            Bytes::from_static(&[0x65, 0x88, 0x84]),
        ];
        assert_eq!(extractor.extract(&idr, 0)?, 0);

        // decode order I0 P3 B1 B2 P6 B4 B5
        let frames = [
            (0, 6, 9000, 1),
            (1, 2, 3000, 3000),
            (1, 4, 6000, 6000),
            (0, 12, 18000, 9000),
            (1, 8, 12000, 12000),
            (1, 10, 15000, 15000),
        ];
        let mut prev = 0;
        for (slice_type, poc, pts, expected) in frames {
            let dts = extractor.extract(&[slice(slice_type, poc)], pts)?;
            assert_eq!(dts, expected, "poc {poc}");
            assert!(dts > prev, "poc {poc}");
            assert!(dts <= pts, "poc {poc}");
            prev = dts;
        }
        Ok(())
    }

    #[test]
    fn test_h264_without_b_frames() -> HlsResult<()> {
        let mut extractor = DtsExtractor::new_h264();
        let idr = vec![
            Bytes::from_static(&SPS),
            Bytes::from_static(&PPS),
            Bytes::from_static(&[0x65, 0x88, 0x84]),
        ];
        assert_eq!(extractor.extract(&idr, 90000)?, 90000);
        for i in 1..5u32 {
            let pts = 90000 + i as i64 * 3000;
            assert_eq!(extractor.extract(&[slice(0, i * 2)], pts)?, pts);
        }
        Ok(())
    }

    #[test]
    fn test_dts_strictly_increasing_across_gops() -> HlsResult<()> {
        let mut extractor = DtsExtractor::new_h264();
        let idr = vec![
            Bytes::from_static(&SPS),
            Bytes::from_static(&PPS),
            Bytes::from_static(&[0x65, 0x88, 0x84]),
        ];

        let mut dts = Vec::new();
        for gop in 0..3i64 {
            let base = gop * 21000;
            dts.push(extractor.extract(&idr, base)?);
            // P3 B1 B2 P6 B4 B5
            for (poc, offset) in [(6, 3), (2, 1), (4, 2), (12, 6), (8, 4), (10, 5)] {
                dts.push(extractor.extract(&[slice(0, poc)], base + offset * 3000)?);
            }
        }
        assert!(dts.windows(2).all(|w| w[0] < w[1]), "{dts:?}");
        Ok(())
    }

    #[test]
    fn test_h264_missing_sps() {
        let mut extractor = DtsExtractor::new_h264();
        assert!(extractor.extract(&[slice(0, 2)], 0).is_err());
    }
}
