use serde::Deserialize;

/// How the VP8 rewriter re-anchors when a simulcast layer's SSRC goes away
/// and later resumes. Upstreams differ on whether they keep counting
/// PictureID across the gap or restart it, so the behavior is configurable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vp8ResumePolicy {
    /// Capture fresh reference offsets at the resume point. Correct for
    /// encoders that restart PictureID when an encoding is re-enabled.
    #[default]
    ReAnchor,
    /// Keep extending the offsets captured at the previous switch. Correct
    /// for encoders that continue numbering across the gap.
    Continue,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SimulcastConfig {
    /// Start new subscribers on the highest available layer instead of the
    /// lowest.
    #[serde(default)]
    pub best_quality_first: bool,
    /// Enable VP8 temporal-layer filtering on downtracks.
    #[serde(default)]
    pub enable_temporal_layer: bool,
    #[serde(default)]
    pub vp8_resume_policy: Vp8ResumePolicy,
}

/// Per-downtrack simulcast switch state.
///
/// The `ref_*` values anchor incoming PictureID/TL0PICIDX at the most recent
/// switch; the `p_ref_*` values remember what the outgoing stream had reached
/// just before it, so rewritten ids continue seamlessly. `l_*` track the last
/// values actually emitted.
#[derive(Debug, Default)]
pub(crate) struct SimulcastTrackHelpers {
    /// Unix nanos before which no further layer switch may be requested.
    pub switch_delay: i64,
    pub temporal_supported: bool,
    pub temporal_enabled: bool,
    /// Arrival time of the last forwarded packet, for timestamp
    /// extrapolation across a switch.
    pub l_ts_calc: i64,

    pub p_ref_pic_id: u16,
    pub ref_pic_id: u16,
    pub l_pic_id: u16,
    pub p_ref_tlz_idx: u8,
    pub ref_tlz_idx: u8,
    pub l_tlz_idx: u8,
}

impl SimulcastTrackHelpers {
    pub(crate) fn new() -> Self {
        SimulcastTrackHelpers::default()
    }

    /// Re-anchors the VP8 reference state on the keyframe that commits a
    /// switch (or a resume under [`Vp8ResumePolicy::ReAnchor`]).
    pub(crate) fn anchor_vp8(&mut self, picture_id: u16, tl0_pic_idx: u8) {
        self.p_ref_pic_id = self.l_pic_id;
        self.ref_pic_id = picture_id;
        self.p_ref_tlz_idx = self.l_tlz_idx;
        self.ref_tlz_idx = tl0_pic_idx;
    }
}
