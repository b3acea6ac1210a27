//! Request and response bodies for the HTTP API

use serde::{Deserialize, Serialize};
use shade_mixer::calibration::CorrectionKind;
use shade_mixer::{
    ChannelOutcome, ChannelResult, ColorEstimate, ColorSample, DispenseReport, ExtractPreset,
    LabColor, Pigment,
};
use utoipa::ToSchema;

/// Plain status reply
#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
        }
    }
}

/// Samples picked from a photo
#[derive(Debug, Deserialize, ToSchema)]
pub struct AnalyzeRequest {
    /// Gamma-encoded RGB triples from the face region
    #[schema(value_type = Vec<Vec<u8>>, example = json!([[198, 134, 103], [190, 130, 100]]))]
    pub skin: Vec<ColorSample>,
    /// Reference chart patches in canonical order, if one was captured
    #[schema(value_type = Option<Vec<Vec<u8>>>)]
    #[serde(default)]
    pub reference: Option<Vec<ColorSample>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AnalyzeResponse {
    /// CIE L*a*b* (D65)
    #[schema(value_type = Vec<f64>)]
    pub lab: LabColor,
    /// Display color, `#RRGGBB`
    pub hex: String,
    /// Lighting correction that was applied: matrix, gray_gain or none
    #[schema(value_type = String)]
    pub correction: CorrectionKind,
    pub samples_used: usize,
}

impl From<ColorEstimate> for AnalyzeResponse {
    fn from(estimate: ColorEstimate) -> Self {
        Self {
            lab: estimate.lab,
            hex: estimate.lab.to_hex(),
            correction: estimate.correction,
            samples_used: estimate.samples_used,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DispenseRequest {
    /// Target CIE L*a*b*
    #[schema(value_type = Vec<f64>, example = json!([62.0, 12.0, 22.0]))]
    pub lab: LabColor,
    /// Total cycles across all channels; the configured budget if omitted
    pub budget: Option<u32>,
}

/// One pigment's share of a mix
#[derive(Debug, Serialize, ToSchema)]
pub struct PigmentShare {
    #[schema(value_type = String)]
    pub pigment: Pigment,
    pub proportion: f64,
    pub steps: u32,
}

/// What happened on one channel
#[derive(Debug, Serialize, ToSchema)]
pub struct ChannelStatus {
    #[schema(value_type = String)]
    pub pigment: Pigment,
    /// completed, switch_stopped, aborted, failed or not_run
    pub status: String,
    pub steps_requested: u32,
    pub steps_issued: u32,
    pub phases_issued: u64,
    pub stopped_by_switch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ChannelResult> for ChannelStatus {
    fn from(result: ChannelResult) -> Self {
        let stopped_by_switch = result.stopped_by_switch();
        let (status, error) = match result.outcome {
            ChannelOutcome::Completed => ("completed", None),
            ChannelOutcome::SwitchStopped => ("switch_stopped", None),
            ChannelOutcome::Aborted => ("aborted", None),
            ChannelOutcome::Failed(e) => ("failed", Some(e.to_string())),
            ChannelOutcome::NotRun => ("not_run", None),
        };

        Self {
            pigment: result.pigment,
            status: status.to_string(),
            steps_requested: result.steps_requested,
            steps_issued: result.steps_issued,
            phases_issued: result.phases_issued,
            stopped_by_switch,
            error,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DispenseResponse {
    #[schema(value_type = Vec<f64>)]
    pub target: LabColor,
    pub mix: Vec<PigmentShare>,
    pub channels: Vec<ChannelStatus>,
    /// Every channel finished or reached its switch
    pub complete: bool,
}

impl From<DispenseReport> for DispenseResponse {
    fn from(report: DispenseReport) -> Self {
        let complete = report.is_complete();
        let mix = Pigment::ALL
            .iter()
            .map(|&pigment| PigmentShare {
                pigment,
                proportion: report.proportions.get(pigment),
                steps: report.steps[pigment.index()],
            })
            .collect();

        Self {
            target: report.target,
            mix,
            channels: report.channels.into_iter().map(ChannelStatus::from).collect(),
            complete,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExtractRequest {
    /// white, black, red, blue or yellow
    #[schema(value_type = String)]
    pub pigment: Pigment,
    /// full, half, quarter or eighth
    #[schema(value_type = String)]
    pub preset: ExtractPreset,
}
