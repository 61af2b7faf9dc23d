//! Prompt templates for the three inference stages.

pub const SYSTEM_PREAMBLE: &str = "你是一位专业、客观的医疗助手，严格按照提供的格式输出。";

pub fn description_prompt(patient_text: &str, has_image: bool) -> String {
    let image_clause = if has_image {
        "并结合随附的临床图像（如舌象、咽部或皮肤照片）"
    } else {
        "（本次未提供图像，影像观察部分请写“无”）"
    };
    format!(
        "请阅读以下患者自述与问卷信息{image_clause}，客观描述患者的病情。\n\
         输出两部分：\n\
         【文本要点】概括主诉、症状、持续时间与既往史；\n\
         【影像观察】描述图像中可见的异常表现。\n\
         只描述事实，不要给出诊断。\n\n\
         患者信息：\n{patient_text}"
    )
}

pub fn keyword_prompt(description: &str) -> String {
    format!(
        "根据以下病情描述，提取用于检索医学知识库的关键词。\n\
         只输出以空格分隔的中文关键词（不超过10个），不要输出其他内容。\n\n\
         病情描述：\n{description}"
    )
}

pub fn final_report_prompt(
    patient_text: &str,
    description: &str,
    retrieved_context: &str,
    department: &str,
) -> String {
    format!(
        "你是{department}的分诊医生助手。请根据患者原始信息、病情描述和参考资料撰写预问诊报告。\n\
         如果患者症状明显不属于{department}的诊疗范围，只输出“科室选择错误，请重新选择”，不要输出其他内容。\n\
         否则严格按以下格式输出：\n\
         ### 1. 【患者主诉 (Chief Complaint)】\n\
         ### 2. 【关键症状 (Key Symptoms)】\n\
         ### 3. 【影像总结 (Image Summary)】\n\
         ### 4. 【重要笔记 (Important Notes)】\n\
         ### 5. 【风险等级 (Risk Level)】（低/中等/高）\n\
         ### 6. 【建议科室 (Suggested Department)】\n\n\
         患者原始信息：\n{patient_text}\n\n\
         病情描述：\n{description}\n\n\
         参考资料：\n{retrieved_context}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_prompt_names_department_and_rejection_phrase() {
        let prompt = final_report_prompt("咽痛三天", "咽部充血", "急性咽炎……", "耳鼻喉科");

        assert!(prompt.contains("你是耳鼻喉科的分诊医生助手"));
        assert!(prompt.contains("科室选择错误，请重新选择"));
        assert!(prompt.contains("急性咽炎……"));
        assert!(prompt.contains("【建议科室 (Suggested Department)】"));
    }

    #[test]
    fn description_prompt_notes_missing_image() {
        assert!(description_prompt("咽痛", false).contains("本次未提供图像"));
        assert!(!description_prompt("咽痛", true).contains("本次未提供图像"));
    }
}
