//! nf4 CLI - NF4 weight quantization
//!
//! Quantize safetensors weights into NF4 artifacts, decode them back, and compare
//! the block-parallel codec against the element-by-element reference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use nf4_codec::{
    quantization::{create_quantizer, Implementation},
    utils::{artifact_file_name, format_bytes, load_float_tensors, normal_weight, parse_dtype, save_tensors},
    BlockScales, CodecConfig, QloraWeight, QuantizedTensor, ReconstructionError,
};

#[derive(Parser)]
#[command(name = "nf4")]
#[command(author, version, about = "NF4 block-wise weight quantization", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Codec settings shared by the subcommands that encode
#[derive(clap::Args)]
struct CodecArgs {
    /// JSON codec configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Elements per absmax block
    #[arg(long)]
    block_size: Option<usize>,

    /// Block scales per double-quantization group
    #[arg(long)]
    scaler_block_size: Option<usize>,

    /// Store one f32 scale per block
    #[arg(long)]
    no_double_quant: bool,

    /// Run block loops on a single thread
    #[arg(long)]
    serial: bool,
}

impl CodecArgs {
    fn resolve(&self) -> anyhow::Result<CodecConfig> {
        let mut config = match &self.config {
            Some(path) => CodecConfig::from_file(path)?,
            None => CodecConfig::default(),
        };
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(scaler_block_size) = self.scaler_block_size {
            config.scaler_block_size = Some(scaler_block_size);
        }
        if self.no_double_quant {
            config.scaler_block_size = None;
        }
        if self.serial {
            config.parallel = false;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Quantize every compatible tensor of a safetensors file
    Quantize {
        /// Source safetensors file
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory for .nf4 artifacts
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        codec: CodecArgs,
    },

    /// Decode an .nf4 artifact into a safetensors file
    Dequantize {
        /// Source .nf4 artifact
        #[arg(short, long)]
        input: PathBuf,

        /// Destination safetensors file
        #[arg(short, long)]
        output: PathBuf,

        /// Tensor name inside the output file
        #[arg(long, default_value = "weight")]
        name: String,
    },

    /// Show information about an .nf4 artifact
    Info {
        /// Artifact path
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Compare reference and block-parallel codecs on a random weight
    Bench {
        /// Weight rows
        #[arg(long, default_value = "4096")]
        rows: usize,

        /// Weight columns
        #[arg(long, default_value = "4096")]
        cols: usize,

        /// Weight dtype (f32, f16, bf16)
        #[arg(long, default_value = "bf16")]
        dtype: String,

        /// Sampling seed
        #[arg(long, default_value = "0")]
        seed: u64,

        #[command(flatten)]
        codec: CodecArgs,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nf4_codec=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Quantize {
            input,
            output,
            codec,
        } => {
            quantize_file(&input, &output, &codec.resolve()?)?;
        }

        Commands::Dequantize {
            input,
            output,
            name,
        } => {
            dequantize_file(&input, &output, &name)?;
        }

        Commands::Info { input } => {
            show_info(&input)?;
        }

        Commands::Bench {
            rows,
            cols,
            dtype,
            seed,
            codec,
        } => {
            bench(rows, cols, &dtype, seed, &codec.resolve()?)?;
        }
    }

    Ok(())
}

fn quantize_file(input: &Path, output: &Path, config: &CodecConfig) -> anyhow::Result<()> {
    tracing::info!("Quantizing {:?} into {:?}", input, output);
    std::fs::create_dir_all(output)?;

    let tensors = load_float_tensors(input)?;

    let pb = ProgressBar::new(tensors.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?,
    );

    let (mut written, mut original_bytes, mut packed_bytes) = (0usize, 0usize, 0usize);
    for (name, tensor) in &tensors {
        pb.set_message(name.clone());

        if tensor.elem_count() % config.block_size != 0 {
            tracing::warn!(
                "Skipping {}: {} elements not divisible by block size {}",
                name,
                tensor.elem_count(),
                config.block_size
            );
            pb.inc(1);
            continue;
        }

        let qweight = QloraWeight::from_tensor(tensor, config)?;
        let artifact = qweight.artifact();
        artifact.save(output.join(artifact_file_name(name)))?;

        written += 1;
        original_bytes += artifact.original_size();
        packed_bytes += artifact.compressed_size();
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!("Quantized {} of {} tensors", written, tensors.len());
    println!(
        "Size: {} -> {}",
        format_bytes(original_bytes as u64),
        format_bytes(packed_bytes as u64)
    );
    Ok(())
}

fn dequantize_file(input: &Path, output: &Path, name: &str) -> anyhow::Result<()> {
    let qweight = QloraWeight::from_artifact(QuantizedTensor::load(input)?)?;
    let dense = qweight.to_dense()?;

    let mut tensors = HashMap::new();
    tensors.insert(name.to_string(), dense);
    save_tensors(&tensors, output)?;

    println!("Wrote {} {:?} to {:?}", name, qweight.shape(), output);
    Ok(())
}

fn show_info(input: &Path) -> anyhow::Result<()> {
    let artifact = QuantizedTensor::load(input)?;

    println!("Artifact Information");
    println!("====================");
    println!("Shape: {:?}", artifact.shape);
    println!("Dtype: {:?}", artifact.dtype);
    println!("Elements: {}", artifact.numel());
    println!("Block size: {}", artifact.block_size);
    println!("Blocks: {}", artifact.n_blocks());
    match &artifact.scales {
        BlockScales::Full(_) => println!("Scales: full precision"),
        BlockScales::DoubleQuantized(dq) => println!(
            "Scales: double quantized ({} groups of {}, mean {:.5})",
            dq.n_groups(),
            dq.scaler_block_size,
            dq.scaler_mean
        ),
    }
    println!("Original size: {}", format_bytes(artifact.original_size() as u64));
    println!("Compressed size: {}", format_bytes(artifact.compressed_size() as u64));
    println!("Compression ratio: {:.3}", artifact.compression_ratio());

    Ok(())
}

fn bench(rows: usize, cols: usize, dtype: &str, seed: u64, config: &CodecConfig) -> anyhow::Result<()> {
    let dtype = parse_dtype(dtype)?;
    println!("Weight: [{}, {}] {:?}, seed {}", rows, cols, dtype, seed);
    println!("Config: {:?}", config);

    let weight = normal_weight(&[rows, cols], dtype, seed)?;

    let mut artifacts = Vec::new();
    for implementation in [Implementation::Reference, Implementation::Fast] {
        let quantizer = create_quantizer(implementation, config.clone());

        let start = Instant::now();
        let artifact = quantizer.quantize(&weight)?;
        let encode = start.elapsed();

        let start = Instant::now();
        let restored = quantizer.dequantize(&artifact)?;
        let decode = start.elapsed();

        let error = ReconstructionError::between(&weight, &restored)?;
        println!(
            "{:?}: encode {:.2?}, decode {:.2?}, max abs {:.4}, mean abs {:.4}, rmse {:.4}",
            implementation, encode, decode, error.max_abs, error.mean_abs, error.rmse
        );
        artifacts.push(artifact);
    }

    let identical = artifacts[0].data == artifacts[1].data;
    println!("Packed bytes identical: {}", identical);
    if !identical {
        anyhow::bail!("reference and block-parallel codecs disagree");
    }
    Ok(())
}
