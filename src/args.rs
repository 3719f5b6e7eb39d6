// 该文件是 Fenjian （分拣） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser};
use url::Url;

/// 各程序共用的参数，命令行优先于配置文件
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
  /// 配置文件路径（TOML）
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 模型地址，例如 yolov8:weights/best.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,

  /// 图像存储目录
  #[arg(long, value_name = "DIR")]
  pub images: Option<PathBuf>,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,

  /// 标注文字使用的 TTF 字体，替换内置字体
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
}

/// Fenjian 垃圾检测服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct ServeArgs {
  #[command(flatten)]
  pub common: CommonArgs,

  /// 监听地址
  #[arg(long, value_name = "ADDR")]
  pub listen: Option<SocketAddr>,
}

/// 对单张图片执行一次检测与分类
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct OneshotArgs {
  #[command(flatten)]
  pub common: CommonArgs,

  /// 输入图片
  #[arg(long, value_name = "FILE")]
  pub input: PathBuf,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn serve_args_parse() {
    let args = ServeArgs::try_parse_from([
      "fenjian",
      "--listen",
      "127.0.0.1:9000",
      "--model",
      "yolov8:weights/best.onnx",
      "--confidence",
      "0.4",
    ])
    .unwrap();

    assert_eq!(args.listen, Some("127.0.0.1:9000".parse().unwrap()));
    assert_eq!(args.common.confidence, Some(0.4));
    assert_eq!(args.common.model.unwrap().scheme(), "yolov8");
    assert!(args.common.config.is_none());
  }

  #[test]
  fn oneshot_requires_input() {
    assert!(OneshotArgs::try_parse_from(["fenjian-oneshot"]).is_err());
    let args = OneshotArgs::try_parse_from(["fenjian-oneshot", "--input", "bin.jpg"]).unwrap();
    assert_eq!(args.input, PathBuf::from("bin.jpg"));
  }
}
