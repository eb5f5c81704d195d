use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;

pub const NO_ICON: &str = "No icon";
pub const HIDDEN_ICON: &str = "hidden.jpg";
pub const HIDDEN_PREFIX: &str = "Hidden achievement:";

/// Fatal page-level failures. Everything below this level degrades to
/// sentinel values instead of erroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("page is empty or not parseable")]
    Unparseable,
    #[error("no app id found in page")]
    MissingIdentity,
    #[error("no title heading found in page")]
    MissingTitle,
    #[error("no achievement containers found in page")]
    NoAchievements,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameIdentity {
    pub app_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AchievementRecord {
    pub api_name: String,
    pub display_name: String,
    pub description: String,
    pub hidden: bool,
    pub default_value: i64,
    pub icon: String,
    pub icon_gray: String,
    /// Transient classification used only for the interactive multiplayer
    /// filter. Never written to any output file.
    pub multiplayer: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageModel {
    pub identity: GameIdentity,
    pub achievements: Vec<AchievementRecord>,
    pub dlc: BTreeMap<u32, String>,
}

/// Parse one saved stats-page snapshot. Pure, no I/O.
pub fn extract(html: &str) -> Result<PageModel, ExtractError> {
    if html.trim().is_empty() {
        return Err(ExtractError::Unparseable);
    }
    let doc = Html::parse_document(html);

    let app_id = extract_app_id(&doc, html).ok_or(ExtractError::MissingIdentity)?;
    let title_sel = Selector::parse(r#"h1[itemprop="name"]"#).unwrap();
    let title = doc
        .select(&title_sel)
        .next()
        .map(|el| element_text(&el))
        .filter(|title| !title.is_empty())
        .ok_or(ExtractError::MissingTitle)?;

    let achievements = extract_achievements(&doc)?;
    let dlc = extract_dlc(&doc, html);

    Ok(PageModel {
        identity: GameIdentity { app_id, title },
        achievements,
        dlc,
    })
}

/// The set of CDN image names the page references: every 40-hex-digit
/// `.jpg` found in an icon field. Sentinel names never qualify.
pub fn required_images(records: &[AchievementRecord]) -> BTreeSet<String> {
    let hash_re = Regex::new(r"(?i)([0-9a-f]{40})\.jpg").unwrap();
    let mut out = BTreeSet::new();
    for record in records {
        for field in [&record.icon, &record.icon_gray] {
            if let Some(found) = hash_re.captures(field) {
                out.insert(format!("{}.jpg", &found[1]));
            }
        }
    }
    out
}

fn extract_app_id(doc: &Html, raw: &str) -> Option<String> {
    let canonical_sel = Selector::parse(r#"link[rel="canonical"]"#).unwrap();
    let stats_re = Regex::new(r"(?i)/app/(\d+)/stats/?").unwrap();
    for link in doc.select(&canonical_sel) {
        if let Some(href) = link.value().attr("href") {
            if let Some(found) = stats_re.captures(href) {
                return Some(found[1].to_string());
            }
        }
    }

    // The canonical tag can be malformed enough that the tree parser drops
    // its attributes; a raw text scan still finds it.
    let raw_re = Regex::new(
        r#"(?i)<link\s+rel=["']canonical["']\s+href=["']https?://steamdb\.info/app/(\d+)/stats/["']"#,
    )
    .unwrap();
    if let Some(found) = raw_re.captures(raw) {
        return Some(found[1].to_string());
    }

    let og_sel = Selector::parse(r#"meta[property="og:url"]"#).unwrap();
    let app_re = Regex::new(r"(?i)/app/(\d+)").unwrap();
    for meta in doc.select(&og_sel) {
        if let Some(content) = meta.value().attr("content") {
            if let Some(found) = app_re.captures(content) {
                return Some(found[1].to_string());
            }
        }
    }

    None
}

fn extract_achievements(doc: &Html) -> Result<Vec<AchievementRecord>, ExtractError> {
    let container_sel = Selector::parse(r#"div[id^="achievement-"]"#).unwrap();
    let api_sel = Selector::parse("div.achievement_api").unwrap();
    let name_sel = Selector::parse(".achievement_name").unwrap();
    let desc_sel = Selector::parse(".achievement_desc").unwrap();
    let image_sel = Selector::parse(".achievement_image").unwrap();
    let image_small_sel = Selector::parse(".achievement_image_small").unwrap();
    let spoiler_sel = Selector::parse("span.achievement_spoiler").unwrap();
    let italic_sel = Selector::parse("i").unwrap();
    let group_sel = Selector::parse("div.achievement_group").unwrap();

    let mut containers = 0usize;
    let mut seen: HashSet<String> = HashSet::new();
    let mut records = Vec::new();

    for container in doc.select(&container_sel) {
        containers += 1;

        // Containers without a machine name are decorative, not achievements.
        let api_name = match container.select(&api_sel).next() {
            Some(el) => element_text(&el),
            None => continue,
        };
        if !seen.insert(api_name.clone()) {
            continue;
        }

        let display_name = container
            .select(&name_sel)
            .next()
            .map(|el| element_text(&el))
            .unwrap_or_else(|| "Unknown".to_string());
        let description = container
            .select(&desc_sel)
            .next()
            .map(|el| element_text(&el))
            .unwrap_or_else(|| "No description".to_string());

        let icon = image_name(container.select(&image_sel).next());
        let icon_gray = image_name(container.select(&image_small_sel).next());

        let hidden = container.select(&spoiler_sel).next().is_some()
            || container
                .select(&italic_sel)
                .any(|el| element_text(&el) == HIDDEN_PREFIX);
        let multiplayer = container
            .select(&group_sel)
            .next()
            .map(|el| element_text(&el) == "Multiplayer")
            .unwrap_or(false);

        records.push(AchievementRecord {
            api_name,
            display_name,
            description,
            hidden,
            default_value: 0,
            icon,
            icon_gray,
            multiplayer,
        });
    }

    if containers == 0 {
        return Err(ExtractError::NoAchievements);
    }
    Ok(records)
}

fn image_name(el: Option<ElementRef<'_>>) -> String {
    let Some(el) = el else {
        return NO_ICON.to_string();
    };
    let base = el.value().attr("data-name").unwrap_or("").trim();
    let name = if base.to_ascii_lowercase().ends_with(".jpg") {
        base.to_string()
    } else {
        format!("{base}.jpg")
    };
    if name == ".jpg" {
        // Empty base: the page hides this icon, use the bundled placeholder.
        HIDDEN_ICON.to_string()
    } else {
        name
    }
}

/// DLC ids must appear both as a numeric hint in the page text and as a
/// `data-appid` table row. Hints alone are noisy counts; rows alone may
/// list unrelated apps.
fn extract_dlc(doc: &Html, raw: &str) -> BTreeMap<u32, String> {
    let mut hints: HashSet<u32> = HashSet::new();
    let angled_re = Regex::new(r"(?i)>\s*DLC\s+(\d+)\s*<").unwrap();
    for found in angled_re.captures_iter(raw) {
        if let Ok(id) = found[1].parse() {
            hints.insert(id);
        }
    }
    let labeled_re = Regex::new(r"(?i)\b\w*DLC\w*\b[^()]*\(\s*(\d+)\s*\)").unwrap();
    for found in labeled_re.captures_iter(raw) {
        if let Ok(id) = found[1].parse() {
            hints.insert(id);
        }
    }
    if hints.is_empty() {
        return BTreeMap::new();
    }

    let row_sel = Selector::parse("tr[data-appid]").unwrap();
    let cell_sel = Selector::parse("td").unwrap();
    let anchor_sel = Selector::parse("a").unwrap();

    let mut out = BTreeMap::new();
    for row in doc.select(&row_sel) {
        let Some(id) = row
            .value()
            .attr("data-appid")
            .and_then(|v| v.trim().parse::<u32>().ok())
        else {
            continue;
        };
        if !hints.contains(&id) {
            continue;
        }
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        if cells.len() < 2 {
            continue;
        }
        let anchor_matches = cells[0]
            .select(&anchor_sel)
            .next()
            .map(|a| element_text(&a) == id.to_string())
            .unwrap_or(false);
        if !anchor_matches {
            continue;
        }
        let title = element_text(&cells[1]);
        if title.is_empty() {
            continue;
        }
        out.entry(id).or_insert(title);
    }
    out
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}
