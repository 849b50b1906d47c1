//! Semester grade cards: a text and photo overlay on the template PDF,
//! followed by the grade-point appendix page.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::archive::ObjectStore;
use crate::config::Config;
use crate::db::RecordSource;
use crate::models::{
    compute_cgpa, program_display, transcript_number, CourseRow, DocumentKind, RenderSummary,
    StudentFilter, StudentRow,
};
use crate::nocodb::{integral_text, TableStore};
use crate::photo::{self, Photo};
use crate::render::{bounded_bar, output_path, RenderError, Uploader};

const BOLD_FONT: &str = "GcBold";
const REGULAR_FONT: &str = "GcRegular";
const PHOTO_XOBJECT: &str = "GcPhoto";

const FIELD_FONT_SIZE: f32 = 10.0;
const NAME_AT: (f32, f32) = (167.5, 702.5);
const REGN_NO_AT: (f32, f32) = (96.0, 683.5);
const PROGRAM_AT: (f32, f32) = (152.0, 665.0);
const ISSUED_AT: (f32, f32) = (460.0, 665.0);
const CARD_NO_AT: (f32, f32) = (460.0, 702.5);
const YEAR_AT: (f32, f32) = (460.0, 683.5);
const CREDITS_AT: (f32, f32) = (475.0, 246.0);
const TOTAL_CREDITS_AT: (f32, f32) = (475.0, 212.0);
const CGPA_AT: (f32, f32) = (475.0, 178.0);

/// x, y, width, height of the photo box.
const PHOTO_BOX: (f32, f32, f32, f32) = (485.0, 732.0, 63.0, 78.0);

const TABLE_ORIGIN: (f32, f32) = (80.0, 590.0);
const TABLE_FIRST_ROW_DROP: f32 = 20.0;
const TABLE_COLUMN_OFFSETS: [f32; 5] = [-18.0, 25.0, 90.0, 385.0, 440.0];
const TABLE_FONT_SIZE: f32 = 8.6;
const TABLE_ROW_STEP: f32 = 16.5;

/// Page attributes a page may inherit from its ancestors.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];
const MAX_TREE_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct GradeCardFields {
    pub name: String,
    pub regn_no: String,
    pub program: String,
    pub date_of_issue: String,
    pub card_no: String,
    pub year: String,
    pub credits: String,
    pub total_credits: String,
    pub cgpa: String,
    /// Serial, code, title, credits, grade.
    pub rows: Vec<[String; 5]>,
}

fn parse_number(value: Option<&str>) -> Option<f64> {
    value.and_then(|text| text.trim().parse::<f64>().ok())
}

pub fn grade_card_fields(
    student: &StudentRow,
    courses: &[CourseRow],
    issued_on: NaiveDate,
    year_override: Option<&str>,
) -> GradeCardFields {
    let semester_credits: f64 = courses
        .iter()
        .filter_map(|course| parse_number(course.credit.as_deref()))
        .sum();

    let cgpa = parse_number(student.cgpa.as_deref()).unwrap_or_else(|| compute_cgpa(courses).0);

    let rows = courses
        .iter()
        .enumerate()
        .map(|(index, course)| {
            [
                (index + 1).to_string(),
                course.subject_code.clone().unwrap_or_else(|| "N/A".into()),
                course.subject_name.clone().unwrap_or_else(|| "N/A".into()),
                course
                    .credit
                    .as_deref()
                    .map(integral_text)
                    .unwrap_or_else(|| "0".into()),
                course.grade.clone().unwrap_or_else(|| "N/A".into()),
            ]
        })
        .collect();

    GradeCardFields {
        name: student.display_name().to_uppercase(),
        regn_no: student.regn_no.clone(),
        program: program_display(student, DocumentKind::GradeCard),
        date_of_issue: issued_on.format("%d %B %Y").to_string(),
        card_no: transcript_number(&student.regn_no),
        year: year_override
            .map(str::to_string)
            .or_else(|| student.year_of_completion.as_deref().map(integral_text))
            .unwrap_or_else(|| "N/A".into()),
        credits: (semester_credits.trunc() as i64).to_string(),
        total_credits: student
            .cumulative_credits
            .as_deref()
            .map(integral_text)
            .unwrap_or_else(|| "0".into()),
        cgpa: format!("{cgpa:.2}"),
        rows,
    }
}

/// Latin-1 bytes for the standard fonts' WinAnsi encoding; other characters become `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

fn show_text(ops: &mut Vec<Operation>, font: &str, size: f32, (x, y): (f32, f32), text: &str) {
    ops.push(Operation::new("BT", vec![]));
    ops.push(Operation::new(
        "Tf",
        vec![Object::Name(font.as_bytes().to_vec()), size.into()],
    ));
    ops.push(Operation::new("Td", vec![x.into(), y.into()]));
    ops.push(Operation::new(
        "Tj",
        vec![Object::String(win_ansi(text), StringFormat::Literal)],
    ));
    ops.push(Operation::new("ET", vec![]));
}

fn overlay_operations(fields: &GradeCardFields) -> Vec<Operation> {
    let mut ops = Vec::new();

    let (x, y, width, height) = PHOTO_BOX;
    ops.push(Operation::new("q", vec![]));
    ops.push(Operation::new(
        "cm",
        vec![width.into(), 0.into(), 0.into(), height.into(), x.into(), y.into()],
    ));
    ops.push(Operation::new(
        "Do",
        vec![Object::Name(PHOTO_XOBJECT.as_bytes().to_vec())],
    ));
    ops.push(Operation::new("Q", vec![]));

    show_text(&mut ops, BOLD_FONT, FIELD_FONT_SIZE, NAME_AT, &fields.name);
    for (at, text) in [
        (REGN_NO_AT, &fields.regn_no),
        (PROGRAM_AT, &fields.program),
        (ISSUED_AT, &fields.date_of_issue),
        (CARD_NO_AT, &fields.card_no),
        (YEAR_AT, &fields.year),
        (CREDITS_AT, &fields.credits),
        (TOTAL_CREDITS_AT, &fields.total_credits),
        (CGPA_AT, &fields.cgpa),
    ] {
        show_text(&mut ops, REGULAR_FONT, FIELD_FONT_SIZE, at, text);
    }

    let (table_x, table_y) = TABLE_ORIGIN;
    let mut y = table_y - TABLE_FIRST_ROW_DROP;
    for row in &fields.rows {
        for (offset, text) in TABLE_COLUMN_OFFSETS.iter().zip(row.iter()) {
            show_text(&mut ops, REGULAR_FONT, TABLE_FONT_SIZE, (table_x + offset, y), text);
        }
        y -= TABLE_ROW_STEP;
    }

    ops
}

fn inherited(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        let parent = node.get(b"Parent").and_then(Object::as_reference).ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

/// Copies inherited attributes onto the page itself so it can stand alone.
fn pin_inherited(doc: &mut Document, page_id: ObjectId) -> Result<(), RenderError> {
    let pinned: Vec<(&[u8], Object)> = INHERITABLE
        .iter()
        .filter(|key| {
            doc.get_dictionary(page_id)
                .map(|page| !page.has(key))
                .unwrap_or(false)
        })
        .filter_map(|key| inherited(doc, page_id, key).map(|value| (*key, value)))
        .collect();

    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    for (key, value) in pinned {
        page.set(key.to_vec(), value);
    }
    Ok(())
}

fn page_resources_mut(doc: &mut Document, page_id: ObjectId) -> Result<&mut Dictionary, RenderError> {
    let linked = match doc.get_dictionary(page_id)?.get(b"Resources") {
        Ok(Object::Reference(id)) => Some(*id),
        _ => None,
    };
    if let Some(id) = linked {
        return Ok(doc.get_object_mut(id)?.as_dict_mut()?);
    }

    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    if !page.has(b"Resources") {
        page.set("Resources", Dictionary::new());
    }
    Ok(page.get_mut(b"Resources")?.as_dict_mut()?)
}

/// Adds `name -> object_id` under a resource category such as `Font`,
/// whether the category is inline, indirect or absent.
fn register_resource(
    doc: &mut Document,
    page_id: ObjectId,
    category: &[u8],
    name: &str,
    object_id: ObjectId,
) -> Result<(), RenderError> {
    let nested = {
        let resources = page_resources_mut(doc, page_id)?;
        match resources.get(category) {
            Ok(Object::Reference(id)) => Some(*id),
            Ok(Object::Dictionary(_)) => None,
            _ => {
                resources.set(category.to_vec(), Dictionary::new());
                None
            }
        }
    };

    let entries = match nested {
        Some(id) => doc.get_object_mut(id)?.as_dict_mut()?,
        None => page_resources_mut(doc, page_id)?
            .get_mut(category)?
            .as_dict_mut()?,
    };
    entries.set(name.as_bytes().to_vec(), Object::Reference(object_id));
    Ok(())
}

fn standard_font(doc: &mut Document, base_font: &str) -> ObjectId {
    doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => base_font,
        "Encoding" => "WinAnsiEncoding",
    })
}

fn photo_xobject(doc: &mut Document, photo: &Photo) -> ObjectId {
    let image = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(photo.width),
            "Height" => i64::from(photo.height),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
        },
        photo.rgb.clone(),
    );
    doc.add_object(image)
}

/// The existing page content is isolated in `q ... Q` so its graphics
/// state cannot leak into the overlay.
fn append_overlay(doc: &mut Document, page_id: ObjectId, overlay: Vec<u8>) -> Result<(), RenderError> {
    let existing = doc.get_page_contents(page_id);
    let save = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let restore = doc.add_object(Stream::new(Dictionary::new(), b"\nQ\n".to_vec()));
    let overlay = doc.add_object(Stream::new(Dictionary::new(), overlay));

    let mut contents = vec![Object::Reference(save)];
    contents.extend(existing.into_iter().map(Object::Reference));
    contents.push(Object::Reference(restore));
    contents.push(Object::Reference(overlay));

    doc.get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Contents", Object::Array(contents));
    Ok(())
}

fn collect_references(doc: &Document, object: &Object, seen: &mut BTreeSet<ObjectId>) {
    match object {
        Object::Reference(id) => {
            if seen.insert(*id) {
                if let Ok(target) = doc.get_object(*id) {
                    collect_references(doc, target, seen);
                }
            }
        }
        Object::Array(items) => {
            for item in items {
                collect_references(doc, item, seen);
            }
        }
        Object::Dictionary(dict) => collect_dictionary(doc, dict, seen),
        Object::Stream(stream) => collect_dictionary(doc, &stream.dict, seen),
        _ => {}
    }
}

fn collect_dictionary(doc: &Document, dict: &Dictionary, seen: &mut BTreeSet<ObjectId>) {
    for (key, value) in dict.iter() {
        if key.as_slice() != b"Parent" {
            collect_references(doc, value, seen);
        }
    }
}

fn pages_root(doc: &Document) -> Result<ObjectId, RenderError> {
    let root = doc.trailer.get(b"Root")?.as_reference()?;
    Ok(doc.get_dictionary(root)?.get(b"Pages")?.as_reference()?)
}

fn first_page(doc: &Document, label: &str) -> Result<ObjectId, RenderError> {
    doc.get_pages()
        .get(&1)
        .copied()
        .ok_or_else(|| RenderError::EmptyDocument(label.to_string()))
}

/// Appends page 1 of `source` (and everything it references) to `doc`.
fn append_first_page(doc: &mut Document, source: &Document) -> Result<(), RenderError> {
    let mut source = source.clone();
    source.renumber_objects_with(doc.max_id + 1);
    let page_id = first_page(&source, "grade point table")?;
    pin_inherited(&mut source, page_id)?;

    let mut reachable = BTreeSet::new();
    collect_references(&source, &Object::Reference(page_id), &mut reachable);
    for id in reachable {
        if let Ok(object) = source.get_object(id) {
            doc.objects.insert(id, object.clone());
        }
    }
    doc.max_id = doc.max_id.max(source.max_id);

    let pages_id = pages_root(doc)?;
    doc.get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Parent", Object::Reference(pages_id));

    let pages = doc.get_object_mut(pages_id)?.as_dict_mut()?;
    pages
        .get_mut(b"Kids")?
        .as_array_mut()?
        .push(Object::Reference(page_id));
    let count = pages.get(b"Count")?.as_i64()?;
    pages.set("Count", count + 1);
    Ok(())
}

/// Builds one grade card from the loaded template and appendix.
pub fn render_grade_card(
    template: &Document,
    appendix: &Document,
    fields: &GradeCardFields,
    photo: &Photo,
) -> Result<Document, RenderError> {
    let mut doc = template.clone();

    let extra_pages: Vec<u32> = doc.get_pages().keys().copied().filter(|n| *n != 1).collect();
    if !extra_pages.is_empty() {
        doc.delete_pages(&extra_pages);
    }
    let page_id = first_page(&doc, "grade card template")?;
    pin_inherited(&mut doc, page_id)?;

    let bold = standard_font(&mut doc, "Helvetica-Bold");
    let regular = standard_font(&mut doc, "Helvetica");
    let image = photo_xobject(&mut doc, photo);
    register_resource(&mut doc, page_id, b"Font", BOLD_FONT, bold)?;
    register_resource(&mut doc, page_id, b"Font", REGULAR_FONT, regular)?;
    register_resource(&mut doc, page_id, b"XObject", PHOTO_XOBJECT, image)?;

    let overlay = Content {
        operations: overlay_operations(fields),
    }
    .encode()?;
    append_overlay(&mut doc, page_id, overlay)?;

    append_first_page(&mut doc, appendix)?;
    Ok(doc)
}

pub fn save(doc: &mut Document, path: &Path) -> Result<(), RenderError> {
    doc.save(path).map_err(|err| RenderError::io(path, err))?;
    Ok(())
}

fn load_asset(path: &Path, label: &str) -> anyhow::Result<Document> {
    anyhow::ensure!(path.exists(), "{label} not found at {}", path.display());
    Document::load(path).with_context(|| format!("failed to load {label} {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct GradeCardRequest {
    pub year_flag: i64,
    pub admission_year: i64,
    pub regn_no: Option<String>,
    pub program: Option<String>,
    pub year_of_completion: Option<String>,
}

impl GradeCardRequest {
    fn filter(&self) -> StudentFilter {
        StudentFilter {
            year_flag: Some(self.year_flag),
            admission_year: Some(self.admission_year),
            regn_no: self.regn_no.clone(),
            program_code: self.program.clone(),
            consolidated_only: false,
        }
    }
}

/// Generates one grade card per matching student, optionally archiving each.
///
/// Missing template assets and database failures on the student query are
/// fatal; everything that goes wrong for a single student only skips that
/// student.
pub async fn generate_grade_cards<R, S, O>(
    records: &R,
    config: &Config,
    store: &S,
    uploader: Option<&Uploader<'_, O>>,
    request: &GradeCardRequest,
) -> anyhow::Result<RenderSummary>
where
    R: RecordSource,
    S: TableStore,
    O: ObjectStore,
{
    let template = load_asset(&config.assets.grade_card_template, "grade card template")?;
    let appendix = load_asset(&config.assets.grade_point_table, "grade point table")?;

    let mut summary = RenderSummary {
        batch: uploader.map(|u| u.batch().to_string()),
        ..RenderSummary::default()
    };

    let students = records.students(&request.filter()).await?;
    summary.students = students.len();
    if students.is_empty() {
        info!(year_flag = request.year_flag, "no data: no students match the filters");
        return Ok(summary);
    }

    tokio::fs::create_dir_all(&config.gradecard_out_dir)
        .await
        .with_context(|| format!("failed to create {}", config.gradecard_out_dir.display()))?;
    let http = photo::http_client()?;
    let issued_on = Local::now().date_naive();
    let progress = bounded_bar(students.len() as u64, "grade cards");

    for student in &students {
        let span = info_span!("grade_card", regn_no = %student.regn_no);
        let outcome = async {
            let courses = records.semester_courses(&student.regn_no, request.year_flag).await?;
            anyhow::ensure!(!courses.is_empty(), "no course data for YEAR_FLAG {}", request.year_flag);

            let url = photo::photo_url(store, &config.nocodb.photo_field, &student.regn_no).await;
            let photo = photo::load_photo(&http, url.as_deref(), &config.assets.photo_dir, &student.regn_no).await;
            debug!(source = ?photo.source, "photo resolved");

            let fields = grade_card_fields(student, &courses, issued_on, request.year_of_completion.as_deref());
            let mut doc = render_grade_card(&template, &appendix, &fields, &photo)?;
            let path = output_path(&config.gradecard_out_dir, student, DocumentKind::GradeCard);
            save(&mut doc, &path)?;
            Ok::<_, anyhow::Error>(path)
        }
        .instrument(span)
        .await;

        match outcome {
            Ok(path) => {
                info!(regn_no = %student.regn_no, path = %path.display(), "grade card generated");
                summary.generated += 1;
                if let Some(uploader) = uploader {
                    uploader
                        .archive(DocumentKind::GradeCard, &path, student, &mut summary)
                        .await;
                }
            }
            Err(err) => {
                warn!(regn_no = %student.regn_no, error = %err, "grade card skipped");
                summary.skipped += 1;
            }
        }
        progress.inc(1);
    }

    progress.finish_and_clear();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fake::MemoryObjectStore;
    use crate::db::fake::MemoryRecords;
    use crate::nocodb::fake::MemoryStore;

    fn one_page_pdf(label: &str) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let fonts_id = doc.add_object(dictionary! { "F1" => font_id });
        let resources_id = doc.add_object(dictionary! { "Font" => fonts_id });

        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![50.into(), 50.into()]),
                Operation::new("Tj", vec![Object::string_literal(label)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    fn student() -> StudentRow {
        StudentRow {
            regn_no: "AU21UG-001".into(),
            name: Some("Avery Lee".into()),
            program_code: Some("DT".into()),
            year_of_completion: Some("2025".into()),
            cumulative_credits: Some("120.0".into()),
            cgpa: Some("8.456".into()),
            ..StudentRow::default()
        }
    }

    fn courses() -> Vec<CourseRow> {
        vec![
            CourseRow {
                subject_code: Some("CS101".into()),
                subject_name: Some("Programming".into()),
                credit: Some("4".into()),
                grade: Some("A".into()),
                ..CourseRow::default()
            },
            CourseRow {
                subject_code: Some("MA101".into()),
                subject_name: Some("Calculus".into()),
                credit: Some("2.5".into()),
                grade: Some("O".into()),
                ..CourseRow::default()
            },
        ]
    }

    fn font_names(doc: &Document, page_id: ObjectId) -> Vec<String> {
        let page = doc.get_dictionary(page_id).unwrap();
        let resources = doc
            .get_dictionary(page.get(b"Resources").unwrap().as_reference().unwrap())
            .unwrap();
        let fonts = doc
            .get_dictionary(resources.get(b"Font").unwrap().as_reference().unwrap())
            .unwrap();
        fonts
            .iter()
            .map(|(key, _)| String::from_utf8_lossy(key).to_string())
            .collect()
    }

    #[test]
    fn fields_follow_card_conventions() {
        let issued = NaiveDate::from_ymd_opt(2025, 6, 3).unwrap();
        let fields = grade_card_fields(&student(), &courses(), issued, None);

        assert_eq!(fields.name, "AVERY LEE");
        assert_eq!(fields.program, "Digital Transformation");
        assert_eq!(fields.date_of_issue, "03 June 2025");
        assert_eq!(fields.card_no, "AU/21/UG/001");
        assert_eq!(fields.year, "2025");
        assert_eq!(fields.credits, "6");
        assert_eq!(fields.total_credits, "120");
        assert_eq!(fields.cgpa, "8.46");
        assert_eq!(
            fields.rows[1],
            ["2", "MA101", "Calculus", "2.5", "O"].map(String::from)
        );

        let overridden = grade_card_fields(&student(), &courses(), issued, Some("2026"));
        assert_eq!(overridden.year, "2026");
    }

    #[test]
    fn cgpa_is_computed_when_the_store_has_none() {
        let mut student = student();
        student.cgpa = None;
        let fields = grade_card_fields(
            &student,
            &courses(),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            None,
        );
        assert_eq!(fields.cgpa, "8.77");
    }

    #[test]
    fn non_latin_text_is_replaced() {
        assert_eq!(win_ansi("José"), b"Jos\xe9".to_vec());
        assert_eq!(win_ansi("Ω"), b"?".to_vec());
    }

    #[test]
    fn overlay_lands_on_template_and_appendix_follows() {
        let template = one_page_pdf("Grade Card");
        let appendix = one_page_pdf("Grade points");
        let fields = grade_card_fields(
            &student(),
            &courses(),
            NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            None,
        );

        let mut doc = render_grade_card(&template, &appendix, &fields, &Photo::placeholder()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.pdf");
        save(&mut doc, &path).unwrap();
        let reloaded = Document::load(&path).unwrap();

        let pages = reloaded.get_pages();
        assert_eq!(pages.len(), 2);

        let first = pages[&1];
        let text = String::from_utf8_lossy(&reloaded.get_page_content(first).unwrap()).to_string();
        assert!(text.contains("Grade Card"));
        assert!(text.contains("AVERY LEE"));
        assert!(text.contains("CS101"));
        assert!(text.contains("/GcPhoto Do"));

        let mut fonts = font_names(&reloaded, first);
        fonts.sort();
        assert_eq!(fonts, vec!["F1", "GcBold", "GcRegular"]);

        let second = pages[&2];
        let appendix_text =
            String::from_utf8_lossy(&reloaded.get_page_content(second).unwrap()).to_string();
        assert!(appendix_text.contains("Grade points"));
        let appendix_page = reloaded.get_dictionary(second).unwrap();
        assert!(appendix_page.has(b"MediaBox"));
    }

    #[test]
    fn template_without_pages_is_rejected() {
        let mut empty = Document::with_version("1.5");
        let pages_id = empty.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => Vec::<Object>::new(),
            "Count" => 0,
        });
        let catalog_id = empty.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        empty.trailer.set("Root", catalog_id);

        let fields = grade_card_fields(
            &student(),
            &courses(),
            NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            None,
        );
        let err = render_grade_card(&empty, &one_page_pdf("x"), &fields, &Photo::placeholder())
            .unwrap_err();
        assert!(matches!(err, RenderError::EmptyDocument(_)));
    }

    fn write_assets(config: &Config) {
        save(&mut one_page_pdf("Grade Card"), &config.assets.grade_card_template).unwrap();
        save(&mut one_page_pdf("Grade points"), &config.assets.grade_point_table).unwrap();
    }

    fn request() -> GradeCardRequest {
        GradeCardRequest {
            year_flag: 1,
            admission_year: 2021,
            regn_no: None,
            program: None,
            year_of_completion: None,
        }
    }

    #[tokio::test]
    async fn no_matching_students_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        write_assets(&config);

        let summary = generate_grade_cards(
            &MemoryRecords::default(),
            &config,
            &MemoryStore::default(),
            None::<&Uploader<'_, MemoryObjectStore>>,
            &request(),
        )
        .await
        .unwrap();

        assert_eq!(summary.students, 0);
        assert_eq!(summary.generated, 0);
        assert!(summary.batch.is_none());
        assert!(!config.gradecard_out_dir.exists());
    }

    #[tokio::test]
    async fn missing_template_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());

        let err = generate_grade_cards(
            &MemoryRecords::default(),
            &config,
            &MemoryStore::default(),
            None::<&Uploader<'_, MemoryObjectStore>>,
            &request(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("grade card template not found"));
    }

    #[tokio::test]
    async fn student_without_courses_is_skipped_and_the_rest_archived() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        write_assets(&config);

        let mut records = MemoryRecords::default();
        records.add(student(), courses());
        records.add(
            StudentRow {
                regn_no: "AU21UG-002".into(),
                name: Some("Jules Moreno".into()),
                ..StudentRow::default()
            },
            Vec::new(),
        );
        let objects = MemoryObjectStore::default();
        let uploader = Uploader::with_batch(&objects, "20250603_101500".into());

        let summary = generate_grade_cards(
            &records,
            &config,
            &MemoryStore::default(),
            Some(&uploader),
            &request(),
        )
        .await
        .unwrap();

        assert_eq!((summary.students, summary.generated, summary.skipped), (2, 1, 1));
        assert_eq!((summary.uploaded, summary.upload_failures), (1, 0));
        assert_eq!(summary.batch.as_deref(), Some("20250603_101500"));

        let written: Vec<String> = std::fs::read_dir(&config.gradecard_out_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(written, vec!["AU21UG-001_Avery_Lee_GradeCard.pdf"]);
        assert_eq!(
            objects.keys(),
            vec!["gradecards/20250603_101500/AU21UG-001_Avery_Lee.pdf"]
        );

        let card = Document::load(config.gradecard_out_dir.join(&written[0])).unwrap();
        assert_eq!(card.get_pages().len(), 2);
    }
}
