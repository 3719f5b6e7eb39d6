// 该文件是 Fenjian （分拣） 项目的一部分。
// src/bin/oneshot.rs - 单张图片检测
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use fenjian::{
  args::OneshotArgs,
  config::Config,
  model::Yolov8Builder,
  service::DetectService,
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = OneshotArgs::parse();
  let config = Config::load(&args.common)?;

  info!("模型地址: {}", config.model.url);
  info!("输入图片: {}", args.input.display());

  let model = Yolov8Builder::from_settings(&config.model)?.build()?;
  let service = DetectService::from_config(model, &config)?;

  let bytes = std::fs::read(&args.input)
    .with_context(|| format!("无法读取输入图片 {}", args.input.display()))?;
  let filename = args
    .input
    .file_name()
    .and_then(|name| name.to_str())
    .context("输入图片路径缺少文件名")?;

  let response = service.detect(&bytes, filename)?;
  println!("{}", serde_json::to_string_pretty(&response)?);

  Ok(())
}
