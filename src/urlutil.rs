//! URL 与文件名工具
//!
//! 下载入口的第一道关卡：URL 校验、Referer 来源推导、
//! 从 URL 提取并清洗文件名、按扩展名归类。

use crate::error::DownloadError;

/// URL 最大长度
const MAX_URL_LENGTH: usize = 2048;

/// 默认分类对应的扩展名列表（可被设置覆盖，见 store 的 `file_types_*`）
pub const DEFAULT_EXT_COMPRESSED: &str = "zip,rar,7z,tar,gz,bz2";
pub const DEFAULT_EXT_DOCUMENTS: &str = "pdf,doc,docx,txt,xls,xlsx,ppt,pptx";
pub const DEFAULT_EXT_IMAGES: &str = "jpg,jpeg,png,gif,bmp,webp,svg,ico,tiff,tif";
pub const DEFAULT_EXT_MUSIC: &str = "mp3,wav,flac,aac,ogg,wma,m4a";
pub const DEFAULT_EXT_VIDEO: &str = "mp4,avi,mkv,mov,wmv,flv,webm,m4v";
pub const DEFAULT_EXT_PROGRAMS: &str = "exe,msi,dmg,deb,rpm,apk";

/// 默认分类名（同时也是下载目录下的子文件夹名）
pub const DEFAULT_CATEGORIES: [&str; 6] = [
    "Compressed", "Documents", "Images", "Music", "Video", "Programs",
];

/// 兜底分类
pub const CATEGORY_ALL: &str = "All Downloads";

/// 校验下载 URL
///
/// 全部条件满足才接受：
/// - 协议为 http/https/ftp
/// - 长度不超过 2048
/// - `://` 之后有非空 host；host 为 localhost/127.0.0.1 或包含 `.`
/// - 不包含 `blob:`、`data:`、`.m3u8`、`.mpd` 子串（流媒体清单交给外部助手）
pub fn validate_url(url: &str) -> Result<(), DownloadError> {
    if url.is_empty() || url.len() < 10 {
        return Err(DownloadError::Validation("URL too short".to_string()));
    }

    if !url.starts_with("http://") && !url.starts_with("https://") && !url.starts_with("ftp://") {
        return Err(DownloadError::Validation(
            "unsupported scheme (expected http/https/ftp)".to_string(),
        ));
    }

    if url.contains("blob:") || url.contains("data:") {
        return Err(DownloadError::Validation(
            "blob:/data: URLs are not downloadable".to_string(),
        ));
    }

    if url.contains(".m3u8") || url.contains(".mpd") {
        return Err(DownloadError::Validation(
            "streaming manifest URLs are not supported".to_string(),
        ));
    }

    if url.len() > MAX_URL_LENGTH {
        return Err(DownloadError::Validation("URL too long".to_string()));
    }

    let host = host_of(url)
        .ok_or_else(|| DownloadError::Validation("missing host".to_string()))?;
    if host.is_empty() {
        return Err(DownloadError::Validation("empty host".to_string()));
    }
    if host != "localhost" && host != "127.0.0.1" && !host.contains('.') {
        return Err(DownloadError::Validation(format!(
            "invalid host: {}",
            host
        )));
    }

    Ok(())
}

/// 提取 host（不含端口）
fn host_of(url: &str) -> Option<&str> {
    let rest = &url[url.find("://")? + 3..];
    if rest.is_empty() {
        return None;
    }
    let host_end = rest.find('/').unwrap_or(rest.len());
    let host = &rest[..host_end];
    // 去掉端口
    match host.find(':') {
        Some(pos) => Some(&host[..pos]),
        None => Some(host),
    }
}

/// 从 URL 推导来源：`scheme://host[:port]/`
///
/// 用作默认 Referer，防盗链站点需要
pub fn origin_of(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return String::new();
    };
    let host_start = scheme_end + 3;
    let host_end = url[host_start..]
        .find('/')
        .map(|p| host_start + p)
        .unwrap_or(url.len());
    format!("{}/", &url[..host_end])
}

/// 从 URL 推导文件名
///
/// 取最后一个 `/` 之后的部分，去掉查询串，百分号解码，
/// 清洗 Windows 保留字符，空结果回退为 `download_<id>`
pub fn filename_from_url(url: &str, id: u64) -> String {
    let fallback = format!("download_{}", id);

    let Some(last_slash) = url.rfind('/') else {
        return fallback;
    };
    if last_slash + 1 >= url.len() {
        return fallback;
    }
    let mut name = &url[last_slash + 1..];

    if let Some(query) = name.find('?') {
        name = &name[..query];
    }

    let decoded = percent_decode(name);
    let sanitized = sanitize_filename(&decoded);

    if sanitized.is_empty() {
        fallback
    } else {
        sanitized
    }
}

/// 百分号解码：`%XX`（两位十六进制）还原为对应字节，非法转义原样保留
pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = hex_value(bytes[i + 1]);
            let lo = hex_value(bytes[i + 2]);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push(((hi << 4) | lo) as char);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// 清洗文件名
///
/// 保留字符 `: * ? " < > | \ /` 替换为 `_`，剔除控制字符，
/// 去掉结尾的 `.` 和空格（Windows 不允许）以及开头空格
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\\' | '/' => out.push('_'),
            c if (c as u32) < 32 => {}
            c => out.push(c),
        }
    }

    while out.ends_with('.') || out.ends_with(' ') {
        out.pop();
    }
    out.trim_start_matches(' ').to_string()
}

/// 解析逗号分隔的扩展名列表（小写、去空白）
pub fn parse_extensions(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

/// 分类扩展名表：`(分类名, 扩展名 CSV)`
///
/// 调用方先用 store 设置覆盖默认值，再交给 [`classify_filename`]
pub fn default_extension_map() -> Vec<(&'static str, &'static str)> {
    vec![
        ("Compressed", DEFAULT_EXT_COMPRESSED),
        ("Documents", DEFAULT_EXT_DOCUMENTS),
        ("Images", DEFAULT_EXT_IMAGES),
        ("Music", DEFAULT_EXT_MUSIC),
        ("Video", DEFAULT_EXT_VIDEO),
        ("Programs", DEFAULT_EXT_PROGRAMS),
    ]
}

/// 按扩展名归类文件，未命中任何分类时落入 `All Downloads`
pub fn classify_filename(filename: &str, ext_map: &[(String, Vec<String>)]) -> String {
    let Some(dot) = filename.rfind('.') else {
        return CATEGORY_ALL.to_string();
    };
    let ext = filename[dot + 1..].to_ascii_lowercase();
    if ext.is_empty() {
        return CATEGORY_ALL.to_string();
    }

    for (category, exts) in ext_map {
        if exts.iter().any(|e| *e == ext) {
            return category.clone();
        }
    }
    CATEGORY_ALL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url_accepts_normal() {
        assert!(validate_url("https://example.com/file.zip").is_ok());
        assert!(validate_url("http://localhost/file.zip").is_ok());
        assert!(validate_url("http://127.0.0.1:8080/a.bin").is_ok());
        assert!(validate_url("ftp://ftp.example.com/pub/file.tar.gz").is_ok());
    }

    #[test]
    fn test_validate_url_rejects_bad_scheme() {
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("javascript:alert(1)").is_err());
        assert!(validate_url("").is_err());
    }

    #[test]
    fn test_validate_url_rejects_streaming_and_blob() {
        assert!(validate_url("https://example.com/live/index.m3u8").is_err());
        assert!(validate_url("https://example.com/manifest.mpd").is_err());
        assert!(validate_url("https://example.com/blob:deadbeef").is_err());
        assert!(validate_url("https://example.com/data:text").is_err());
    }

    #[test]
    fn test_validate_url_rejects_bad_host() {
        // 无点号的裸主机名（localhost 除外）
        assert!(validate_url("http://intranet/file.zip").is_err());
        assert!(validate_url("http:///file.zip").is_err());
    }

    #[test]
    fn test_validate_url_rejects_too_long() {
        let url = format!("https://example.com/{}", "a".repeat(2100));
        assert!(validate_url(&url).is_err());
    }

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://example.com/path/to/file.zip"),
            "https://example.com/"
        );
        assert_eq!(
            origin_of("http://example.com:8080/x"),
            "http://example.com:8080/"
        );
        assert_eq!(origin_of("https://example.com"), "https://example.com/");
        assert_eq!(origin_of("not-a-url"), "");
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://example.com/dir/report.pdf", 1),
            "report.pdf"
        );
        // 去掉查询串
        assert_eq!(
            filename_from_url("https://example.com/a.zip?token=abc", 1),
            "a.zip"
        );
        // 百分号解码
        assert_eq!(
            filename_from_url("https://example.com/my%20file.txt", 1),
            "my file.txt"
        );
        // 非法转义原样保留
        assert_eq!(
            filename_from_url("https://example.com/a%ZZb.txt", 1),
            "a%ZZb.txt"
        );
        // 空结果兜底
        assert_eq!(filename_from_url("https://example.com/", 42), "download_42");
        assert_eq!(filename_from_url("https://example.com/...", 7), "download_7");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a:b*c?d\"e<f>g|h\\i/j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_filename("name.txt. . "), "name.txt");
        assert_eq!(sanitize_filename("  lead.txt"), "lead.txt");
        assert_eq!(sanitize_filename("ctrl\x01char.bin"), "ctrlchar.bin");
        assert_eq!(sanitize_filename("..."), "");
    }

    #[test]
    fn test_classify_filename() {
        let map: Vec<(String, Vec<String>)> = default_extension_map()
            .into_iter()
            .map(|(cat, csv)| (cat.to_string(), parse_extensions(csv)))
            .collect();

        assert_eq!(classify_filename("a.zip", &map), "Compressed");
        assert_eq!(classify_filename("a.PDF", &map), "Documents");
        assert_eq!(classify_filename("photo.jpeg", &map), "Images");
        assert_eq!(classify_filename("song.mp3", &map), "Music");
        assert_eq!(classify_filename("movie.mkv", &map), "Video");
        assert_eq!(classify_filename("setup.exe", &map), "Programs");
        assert_eq!(classify_filename("noext", &map), "All Downloads");
        assert_eq!(classify_filename("weird.xyz", &map), "All Downloads");
    }

    #[test]
    fn test_parse_extensions() {
        assert_eq!(
            parse_extensions(" Zip, RAR ,7z,,gz "),
            vec!["zip", "rar", "7z", "gz"]
        );
    }
}
