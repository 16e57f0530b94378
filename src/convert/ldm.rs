//! Rule tables for single-file LDM checkpoints (the layout style checkpoints
//! ship in) to the diffusers layout of the live graph.
//!
//! LDM numbers U-Net blocks as a flat `input_blocks.N` / `output_blocks.N`
//! sequence, so the tables are generated from the block layout instead of
//! written out by hand.

use crate::config::{UnetLayout, VaeLayout};
use crate::convert::rules::{Reshape, RewriteRule, RuleTable};

pub const UNET_SCOPE: &str = "model.diffusion_model.";
pub const VAE_SCOPE: &str = "first_stage_model.";
pub const CLIP_SCOPE: &str = "cond_stage_model.transformer.";

/// LDM resnet segment names to diffusers names
const RESNET_RENAMES: &[(&str, &str)] = &[
    (".in_layers.0.", ".norm1."),
    (".in_layers.2.", ".conv1."),
    (".out_layers.0.", ".norm2."),
    (".out_layers.3.", ".conv2."),
    (".emb_layers.1.", ".time_emb_proj."),
    (".skip_connection.", ".conv_shortcut."),
];

/// Diffusion backbone rules
pub fn unet_rules(layout: &UnetLayout) -> RuleTable {
    let mut table = RuleTable::new(UNET_SCOPE);
    let per_block = layout.layers_per_block + 1;

    table
        .push(RewriteRule::prefix("time_embed.0.", "time_embedding.linear_1."))
        .push(RewriteRule::prefix("time_embed.2.", "time_embedding.linear_2."))
        .push(RewriteRule::prefix("input_blocks.0.0.", "conv_in."));

    // input_blocks.0 is conv_in; every block then holds `layers_per_block`
    // resnet(+attention) pairs followed by one downsampler
    for i in 1..layout.num_blocks * per_block {
        let block = (i - 1) / per_block;
        let layer = (i - 1) % per_block;
        if layer < layout.layers_per_block {
            table
                .push(RewriteRule::prefix(
                    format!("input_blocks.{i}.0."),
                    format!("down_blocks.{block}.resnets.{layer}."),
                ))
                .push(RewriteRule::prefix(
                    format!("input_blocks.{i}.1."),
                    format!("down_blocks.{block}.attentions.{layer}."),
                ));
        } else {
            table.push(RewriteRule::prefix(
                format!("input_blocks.{i}.0.op."),
                format!("down_blocks.{block}.downsamplers.0.conv."),
            ));
        }
    }

    table
        .push(RewriteRule::prefix("middle_block.0.", "mid_block.resnets.0."))
        .push(RewriteRule::prefix("middle_block.1.", "mid_block.attentions.0."))
        .push(RewriteRule::prefix("middle_block.2.", "mid_block.resnets.1."));

    // Up blocks carry one extra resnet; the upsampler sits at index 1 when
    // the block has no attention and at index 2 otherwise
    for i in 0..layout.num_blocks * per_block {
        let block = i / per_block;
        let layer = i % per_block;
        for slot in [1, 2] {
            table.push(RewriteRule::prefix(
                format!("output_blocks.{i}.{slot}.conv."),
                format!("up_blocks.{block}.upsamplers.0.conv."),
            ));
        }
        table
            .push(RewriteRule::prefix(
                format!("output_blocks.{i}.0."),
                format!("up_blocks.{block}.resnets.{layer}."),
            ))
            .push(RewriteRule::prefix(
                format!("output_blocks.{i}.1."),
                format!("up_blocks.{block}.attentions.{layer}."),
            ));
    }

    table
        .push(RewriteRule::prefix("out.0.", "conv_norm_out."))
        .push(RewriteRule::prefix("out.2.", "conv_out."));

    for (from, to) in RESNET_RENAMES {
        table.push(RewriteRule::substring(*from, *to));
    }
    table
}

/// Image autoencoder rules
pub fn vae_rules(layout: &VaeLayout) -> RuleTable {
    let mut table = RuleTable::new(VAE_SCOPE);
    let n = layout.num_blocks;

    for i in 0..n {
        table
            .push(RewriteRule::prefix(
                format!("encoder.down.{i}.block."),
                format!("encoder.down_blocks.{i}.resnets."),
            ))
            .push(RewriteRule::prefix(
                format!("encoder.down.{i}.downsample."),
                format!("encoder.down_blocks.{i}.downsamplers.0."),
            ));
    }

    // decoder.up is numbered from the lowest resolution, up_blocks from the highest
    for i in 0..n {
        let block = n - 1 - i;
        table
            .push(RewriteRule::prefix(
                format!("decoder.up.{i}.block."),
                format!("decoder.up_blocks.{block}.resnets."),
            ))
            .push(RewriteRule::prefix(
                format!("decoder.up.{i}.upsample."),
                format!("decoder.up_blocks.{block}.upsamplers.0."),
            ));
    }

    for side in ["encoder", "decoder"] {
        table
            .push(RewriteRule::prefix(
                format!("{side}.mid.block_1."),
                format!("{side}.mid_block.resnets.0."),
            ))
            .push(RewriteRule::prefix(
                format!("{side}.mid.block_2."),
                format!("{side}.mid_block.resnets.1."),
            ))
            .push(RewriteRule::prefix(
                format!("{side}.mid.attn_1."),
                format!("{side}.mid_block.attentions.0."),
            ))
            .push(RewriteRule::prefix(
                format!("{side}.norm_out."),
                format!("{side}.conv_norm_out."),
            ));
    }

    table
        .push(RewriteRule::substring(".nin_shortcut.", ".conv_shortcut."))
        .push(RewriteRule::substring(
            ".attentions.0.norm.",
            ".attentions.0.group_norm.",
        ));
    for (from, to) in [
        ("q", "to_q"),
        ("k", "to_k"),
        ("v", "to_v"),
        ("proj_out", "to_out.0"),
    ] {
        table.push(
            RewriteRule::substring(format!(".attentions.0.{from}."), format!(".attentions.0.{to}."))
                .with_reshape(Reshape::SqueezeConv1x1),
        );
    }
    table
}

/// CLIP text encoder rules. Older transformers releases saved the text
/// model without the `text_model.` root.
pub fn clip_rules() -> RuleTable {
    let mut table = RuleTable::new(CLIP_SCOPE);
    table
        .push(RewriteRule::prefix("embeddings.", "text_model.embeddings."))
        .push(RewriteRule::prefix("encoder.", "text_model.encoder."))
        .push(RewriteRule::prefix(
            "final_layer_norm.",
            "text_model.final_layer_norm.",
        ));
    table
}
