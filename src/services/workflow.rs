//! Builds the backend job description (a ComfyUI node graph) for a job.
//!
//! Pure data shaping: the same [`JobInput`] always yields the same graph. The
//! sampler seed is taken from the job id.

use crate::models::job::{GenerationJob, PoseType};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use uuid::Uuid;

const CLIENT_ID: &str = "avatarforge";
const POSITIVE_NODE: &str = "1";
const LATENT_NODE: &str = "3";

const REALISM_TAGS: &str = "detailed skin texture, natural pores, realistic lighting, \
     professional photography, sharp focus, 8k uhd, high quality, natural colors, \
     soft shadows, realistic depth of field";
const REALISM_NEGATIVE: &str = "plastic, doll, fake, mannequin, smooth skin, oversharpened, \
     artificial, synthetic, airbrushed, waxy skin, porcelain skin, bad quality, blurry, \
     distorted, deformed, disfigured, unrealistic lighting, oversaturated, cartoon, anime, \
     nsfw, nude";
const STYLIZED_NEGATIVE: &str = "nsfw, nude, bad quality, blurry, distorted";

/// Everything the builder needs, assembled once from a job record and the
/// resolved on-disk paths of its reference blobs.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub job_id: Uuid,
    pub prompt: String,
    pub clothing: Option<String>,
    pub style: Option<String>,
    pub realism: bool,
    pub pose_type: Option<PoseType>,
    pub pose_image: Option<PathBuf>,
    pub reference_image: Option<PathBuf>,
}

impl JobInput {
    pub fn from_job(
        job: &GenerationJob,
        pose_image: Option<PathBuf>,
        reference_image: Option<PathBuf>,
    ) -> Self {
        Self {
            job_id: job.id,
            prompt: job.prompt.clone(),
            clothing: job.clothing.clone(),
            style: job.style.clone(),
            realism: job.realism,
            pose_type: job.pose_type,
            pose_image,
            reference_image,
        }
    }
}

/// Build the description sent to the backend's submit endpoint.
pub fn build_job_description(input: &JobInput) -> Value {
    match input.pose_type {
        Some(PoseType::All) => build_all_poses(input),
        Some(pose) => build_pose(input, pose),
        None => build_base(input),
    }
}

fn enhanced_prompt(input: &JobInput) -> String {
    let mut text = input.prompt.trim().to_string();
    if let Some(clothing) = input.clothing.as_deref().filter(|c| !c.is_empty()) {
        text.push_str(&format!(", wearing {}", clothing));
    }
    if let Some(style) = input.style.as_deref().filter(|s| !s.is_empty()) {
        text.push_str(&format!(", {} art style", style));
    }
    if input.realism {
        text.push_str(", ");
        text.push_str(REALISM_TAGS);
    }
    text
}

fn build_base(input: &JobInput) -> Value {
    let (checkpoint, steps, sampler, scheduler, negative) = if input.realism {
        (
            "RealVisXL_V5.0.safetensors",
            30,
            "dpmpp_2m_sde_gpu",
            "karras",
            REALISM_NEGATIVE,
        )
    } else {
        (
            "JuggernautXL_v10.safetensors",
            20,
            "euler",
            "normal",
            STYLIZED_NEGATIVE,
        )
    };
    let seed = input.job_id.as_u64_pair().0;

    let nodes = json!({
        POSITIVE_NODE: {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": enhanced_prompt(input), "clip": ["4", 1] }
        },
        "2": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": negative, "clip": ["4", 1] }
        },
        LATENT_NODE: {
            "class_type": "EmptyLatentImage",
            "inputs": { "width": 512, "height": 512, "batch_size": 1 }
        },
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": { "ckpt_name": checkpoint }
        },
        "5": {
            "class_type": "KSampler",
            "inputs": {
                "seed": seed,
                "steps": steps,
                "cfg": 7.0,
                "sampler_name": sampler,
                "scheduler": scheduler,
                "denoise": 1.0,
                "model": ["4", 0],
                "positive": [POSITIVE_NODE, 0],
                "negative": ["2", 0],
                "latent_image": [LATENT_NODE, 0]
            }
        },
        "6": {
            "class_type": "VAEDecode",
            "inputs": { "samples": ["5", 0], "vae": ["4", 2] }
        },
        "7": {
            "class_type": "UpscaleModelLoader",
            "inputs": { "model_name": "RealESRGAN_x4plus.pth" }
        },
        "8": {
            "class_type": "ImageUpscaleWithModel",
            "inputs": { "upscale_model": ["7", 0], "image": ["6", 0] }
        },
        "9": {
            "class_type": "SaveImage",
            "inputs": { "filename_prefix": CLIENT_ID, "images": ["8", 0] }
        }
    });

    let mut extra = Map::new();
    if let Some(path) = &input.pose_image {
        extra.insert("pose_image".into(), json!(path.display().to_string()));
    }
    if let Some(path) = &input.reference_image {
        extra.insert("reference_image".into(), json!(path.display().to_string()));
    }

    let mut description = json!({ "prompt": nodes, "client_id": CLIENT_ID });
    if !extra.is_empty() {
        description["extra_data"] = Value::Object(extra);
    }
    description
}

fn build_pose(input: &JobInput, pose: PoseType) -> Value {
    let mut description = build_base(input);
    let prompt = input.prompt.trim();
    let text = match pose {
        PoseType::Front => format!(
            "front view, full body shot, {}, standing straight, facing camera",
            prompt
        ),
        PoseType::Back => format!(
            "back view, rear view, {}, showing back, facing away from camera",
            prompt
        ),
        PoseType::Side => format!(
            "side view, profile shot, {}, 90 degree angle, side profile",
            prompt
        ),
        PoseType::Quarter | PoseType::All => {
            format!("3/4 view, three quarter angle, {}, slightly turned", prompt)
        }
    };
    description["prompt"][POSITIVE_NODE]["inputs"]["text"] = json!(text);

    if matches!(pose, PoseType::Side | PoseType::Quarter) {
        let latent = &mut description["prompt"][LATENT_NODE]["inputs"];
        latent["width"] = json!(448);
        latent["height"] = json!(640);
    }
    description
}

fn build_all_poses(input: &JobInput) -> Value {
    let mut workflows = Map::new();
    for pose in PoseType::VIEWS {
        workflows.insert(pose.as_str().to_string(), build_pose(input, pose));
    }
    json!({
        "poses": PoseType::VIEWS.iter().map(PoseType::as_str).collect::<Vec<_>>(),
        "workflows": workflows,
        "request": {
            "prompt": input.prompt,
            "clothing": input.clothing,
            "realism": input.realism
        }
    })
}
